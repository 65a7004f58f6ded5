/// Folds pushed deltas into the stored values.
///
/// One combiner is resolved per job and shared by every key of a shard.
pub trait Combiner: Send {
    /// Should fold `delta` into `stored`.
    ///
    /// # Arguments
    /// * `stored` - The current value of a key, updated in place.
    /// * `delta` - The pushed delta, always as long as `stored`.
    fn combine(&mut self, stored: &mut [f32], delta: &[f32]);
}

/// Element-wise sum, `stored + delta`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Add;

impl Combiner for Add {
    fn combine(&mut self, stored: &mut [f32], delta: &[f32]) {
        stored.iter_mut().zip(delta).for_each(|(s, d)| *s += d);
    }
}

/// The last push wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct Replace;

impl Combiner for Replace {
    fn combine(&mut self, stored: &mut [f32], delta: &[f32]) {
        stored.copy_from_slice(delta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_accumulates() {
        let mut stored = [1.0, 2.0];
        Add.combine(&mut stored, &[0.5, -2.0]);
        Add.combine(&mut stored, &[0.5, 1.0]);
        assert_eq!(stored, [2.0, 1.0]);
    }

    #[test]
    fn replace_overwrites() {
        let mut stored = [1.0, 2.0];
        Replace.combine(&mut stored, &[7.0, 8.0]);
        assert_eq!(stored, [7.0, 8.0]);
    }
}
