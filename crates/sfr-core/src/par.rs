//! Ordered per-item fan-out. Runs on the rayon pool with the `threading`
//! feature and as a plain loop without it; results keep input order in
//! both builds.

/// Apply `f` to every item and collect the results in input order.
#[cfg(feature = "threading")]
pub(crate) fn map_ordered<T, U, F>(items: Vec<T>, f: F) -> Vec<U>
where
    T: Send,
    U: Send,
    F: Fn(T) -> U + Sync + Send,
{
    use rayon::prelude::*;
    items.into_par_iter().map(f).collect()
}

/// Apply `f` to every item and collect the results in input order.
#[cfg(not(feature = "threading"))]
pub(crate) fn map_ordered<T, U, F>(items: Vec<T>, f: F) -> Vec<U>
where
    T: Send,
    U: Send,
    F: Fn(T) -> U + Sync + Send,
{
    items.into_iter().map(f).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_follow_input_order() {
        let items: Vec<u64> = (0..1_000).collect();
        let out = map_ordered(items, |x| x * x);
        assert_eq!(out.len(), 1_000);
        assert!(out.iter().enumerate().all(|(i, &v)| v == (i as u64) * (i as u64)));
    }
}
