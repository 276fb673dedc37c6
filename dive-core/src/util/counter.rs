use crossbeam::atomic::AtomicCell;

/// Monotonic counters used to hand out fresh identifiers.
pub trait Counter {
    type Output;

    fn get_and_increment(self) -> Self::Output;
}

impl Counter for &mut u64 {
    type Output = u64;

    fn get_and_increment(self) -> Self::Output {
        let current = *self;
        *self = u64::checked_add(current, 1).expect("attempt to add with overflow");
        current
    }
}

impl Counter for &AtomicCell<u64> {
    type Output = u64;

    fn get_and_increment(self) -> Self::Output {
        let mut current = self.load();

        loop {
            let mut next = current;
            (&mut next).get_and_increment();

            match self.compare_exchange(current, next) {
                Ok(_) => return current,
                Err(v) => current = v,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_atomic_counter() {
        let counter = AtomicCell::new(5u64);
        assert_eq!(counter.get_and_increment(), 5);
        assert_eq!(counter.get_and_increment(), 6);
        assert_eq!(counter.load(), 7);
    }
}
