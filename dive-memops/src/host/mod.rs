pub(crate) mod elementwise;
pub(crate) mod reduce;

// Below this many elements a range is processed by the calling thread.
const WORK_SPLIT_THRESHOLD: usize = 1024 * 16;

pub trait Policy: Sized + Copy + Send {
    fn join<A, B, RA, RB>(self, left: A, right: B) -> (RA, RB)
    where
        A: FnOnce(Self) -> RA + Send,
        B: FnOnce(Self) -> RB + Send,
        RA: Send,
        RB: Send;
}

#[derive(Debug, Clone, Copy)]
pub struct RayonPolicy;
impl Policy for RayonPolicy {
    fn join<A, B, RA, RB>(self, left: A, right: B) -> (RA, RB)
    where
        A: FnOnce(Self) -> RA + Send,
        B: FnOnce(Self) -> RB + Send,
        RA: Send,
        RB: Send,
    {
        rayon::join(|| left(Self), || right(Self))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SequentialPolicy;
impl Policy for SequentialPolicy {
    fn join<A, B, RA, RB>(self, left: A, right: B) -> (RA, RB)
    where
        A: FnOnce(Self) -> RA + Send,
        B: FnOnce(Self) -> RB + Send,
        RA: Send,
        RB: Send,
    {
        (left(Self), right(Self))
    }
}

/// Fold `data` with `combine`, splitting the work in halves while it is large enough.
///
/// Split points only depend on `data.len()`, so the association order (and thus the result
/// for floating-point data) is the same for every policy.
fn host_fold_recur<P, T, F>(policy: P, data: &[T], combine: &F) -> Option<T>
where
    P: Policy,
    T: Copy + Send + Sync,
    F: Fn(T, T) -> T + Sync,
{
    if data.len() > WORK_SPLIT_THRESHOLD {
        let (left, right) = data.split_at(data.len() / 2);
        let (a, b) = policy.join(
            move |policy| host_fold_recur(policy, left, combine),
            move |policy| host_fold_recur(policy, right, combine),
        );

        return match (a, b) {
            (Some(a), Some(b)) => Some(combine(a, b)),
            (a, b) => a.or(b),
        };
    }

    let (&first, rest) = data.split_first()?;
    Some(rest.iter().fold(first, |acc, &v| combine(acc, v)))
}

/// Apply `fun` to every pair `(dst[i], src(i))`, splitting the work like [`host_fold_recur`].
fn host_zip_recur<P, T, S, F>(policy: P, dst: &mut [T], src: S, fun: &F)
where
    P: Policy,
    T: Send,
    S: Source + Send,
    F: Fn(&mut T, S::Item) + Sync,
{
    if dst.len() > WORK_SPLIT_THRESHOLD {
        let half = dst.len() / 2;
        let (left, right) = dst.split_at_mut(half);
        let (src_left, src_right) = src.split_at(half);

        policy.join(
            move |policy| host_zip_recur(policy, left, src_left, fun),
            move |policy| host_zip_recur(policy, right, src_right, fun),
        );

        return;
    }

    for (i, v) in dst.iter_mut().enumerate() {
        fun(v, src.get(i));
    }
}

/// Right-hand side of an element-wise operation: either a slice or a broadcast scalar.
trait Source: Sized {
    type Item;

    fn split_at(self, mid: usize) -> (Self, Self);
    fn get(&self, index: usize) -> Self::Item;
}

impl<'a, T: Copy> Source for &'a [T] {
    type Item = T;

    fn split_at(self, mid: usize) -> (Self, Self) {
        <[T]>::split_at(self, mid)
    }

    fn get(&self, index: usize) -> T {
        self[index]
    }
}

#[derive(Copy, Clone)]
struct Broadcast<T>(T);

impl<T: Copy> Source for Broadcast<T> {
    type Item = T;

    fn split_at(self, _mid: usize) -> (Self, Self) {
        (self, self)
    }

    fn get(&self, _index: usize) -> T {
        self.0
    }
}
