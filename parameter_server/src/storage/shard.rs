use std::collections::HashMap;

use comms::{Key, PsError, Result, partition::Partitioner};

use crate::storage::Combiner;

/// The values of every key owned by one server.
///
/// Keys are materialised on their first push, absent keys read as zeros.
#[derive(Debug)]
pub struct ParameterShard<C: Combiner> {
    rank: usize,
    partitioner: Partitioner,
    value_len: usize,
    values: HashMap<Key, Box<[f32]>>,
    combiner: C,
}

impl<C: Combiner> ParameterShard<C> {
    /// Creates a new `ParameterShard`.
    ///
    /// # Arguments
    /// * `rank` - The rank of the server owning this shard.
    /// * `partitioner` - The cluster wide key partitioner.
    /// * `value_len` - The length of every value vector.
    /// * `combiner` - How pushed deltas are folded into the stored values.
    pub fn new(rank: usize, partitioner: Partitioner, value_len: usize, combiner: C) -> Self {
        Self {
            rank,
            partitioner,
            value_len,
            values: HashMap::new(),
            combiner,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn value_len(&self) -> usize {
        self.value_len
    }

    /// The amount of keys that received at least one push.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Checks that `key` belongs to this shard.
    ///
    /// # Returns
    /// `PsError::UnknownKey` otherwise.
    pub fn check_owned(&self, key: Key) -> Result<()> {
        let owner = self.partitioner.owner_rank(key)?;

        if owner != self.rank {
            return Err(PsError::UnknownKey {
                key,
                detail: format!("owned by server rank {owner}, not by rank {}", self.rank),
            });
        }

        Ok(())
    }

    /// The current value of `key`.
    pub fn get(&self, key: Key) -> Result<Vec<f32>> {
        self.check_owned(key)?;

        let value = match self.values.get(&key) {
            Some(value) => value.to_vec(),
            None => vec![0.; self.value_len],
        };

        Ok(value)
    }

    /// Folds `delta` into the value of `key`.
    ///
    /// # Returns
    /// `PsError::UnknownKey` or `PsError::SizeMismatch`, in which case nothing is written.
    pub fn apply(&mut self, key: Key, delta: &[f32]) -> Result<()> {
        self.check_delta(key, delta)?;
        self.apply_unchecked(key, delta);
        Ok(())
    }

    /// Checks a whole batch of deltas without writing anything.
    ///
    /// # Arguments
    /// * `keys` - The keys to update.
    /// * `deltas` - One delta per key.
    pub fn validate(&self, keys: &[Key], deltas: &[Vec<f32>]) -> Result<()> {
        if keys.len() != deltas.len() {
            return Err(PsError::Protocol(format!(
                "{} keys but {} values in a push",
                keys.len(),
                deltas.len()
            )));
        }

        keys.iter()
            .zip(deltas)
            .try_for_each(|(&key, delta)| self.check_delta(key, delta))
    }

    /// Applies a whole batch of deltas, or none of them if any is invalid.
    ///
    /// # Arguments
    /// * `keys` - The keys to update, duplicates are applied in order.
    /// * `deltas` - One delta per key.
    pub fn apply_batch(&mut self, keys: &[Key], deltas: &[Vec<f32>]) -> Result<()> {
        self.validate(keys, deltas)?;

        keys.iter()
            .zip(deltas)
            .for_each(|(&key, delta)| self.apply_unchecked(key, delta));

        Ok(())
    }

    /// Reads the values of `keys`, in order.
    pub fn read_batch(&self, keys: &[Key]) -> Result<Vec<Vec<f32>>> {
        keys.iter().map(|&key| self.get(key)).collect()
    }

    fn check_delta(&self, key: Key, delta: &[f32]) -> Result<()> {
        self.check_owned(key)?;

        if delta.len() != self.value_len {
            return Err(PsError::SizeMismatch {
                key,
                got: delta.len(),
                expected: self.value_len,
            });
        }

        Ok(())
    }

    fn apply_unchecked(&mut self, key: Key, delta: &[f32]) {
        let Self {
            values,
            combiner,
            value_len,
            ..
        } = self;

        let stored = values
            .entry(key)
            .or_insert_with(|| vec![0.; *value_len].into_boxed_slice());

        combiner.combine(stored, delta);
    }
}
