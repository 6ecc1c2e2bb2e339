//! Synthetic token id batches, used as tracing input.
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::internal::*;

pub const DEFAULT_SEQUENCE_LENGTH: usize = 128;
pub const DEFAULT_TOKEN_ID_RANGE: i64 = 30522;

/// Uniformly random token ids in `[0, token_id_range)`.
#[derive(Clone, Debug, PartialEq, Eq, new)]
pub struct SyntheticInput {
    pub batch: usize,
    pub sequence_length: usize,
    pub token_id_range: i64,
    pub seed: Option<u64>,
}

impl Default for SyntheticInput {
    fn default() -> SyntheticInput {
        SyntheticInput::new(1, DEFAULT_SEQUENCE_LENGTH, DEFAULT_TOKEN_ID_RANGE, None)
    }
}

impl SyntheticInput {
    pub fn with_seed(self, seed: u64) -> SyntheticInput {
        SyntheticInput { seed: Some(seed), ..self }
    }

    pub fn shape(&self) -> [usize; 2] {
        [self.batch, self.sequence_length]
    }

    /// Fails if some generated id could fall outside the model vocabulary.
    pub fn check_vocabulary(&self, vocab_size: usize) -> PortResult<()> {
        ensure!(
            self.token_id_range as u64 <= vocab_size as u64,
            "Synthetic token ids range up to {}, but the model vocabulary only has {} entries",
            self.token_id_range,
            vocab_size
        );
        Ok(())
    }

    pub fn generate(&self) -> PortResult<Tensor> {
        ensure!(self.batch > 0 && self.sequence_length > 0, "Empty synthetic input {:?}", self.shape());
        ensure!(self.token_id_range > 0, "token_id_range must be positive");
        let mut rng = match self.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        let ids: Vec<i64> = (0..self.batch * self.sequence_length)
            .map(|_| rng.gen_range(0..self.token_id_range))
            .collect();
        Tensor::from_shape(&self.shape(), ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn ids_in_range(seed in any::<u64>()) {
            let t = SyntheticInput::default().with_seed(seed).generate().unwrap();
            prop_assert_eq!(t.shape(), &[1, 128]);
            prop_assert_eq!(t.datum_type(), DatumType::I64);
            prop_assert!(t.as_slice::<i64>().unwrap().iter().all(|&i| (0..30522).contains(&i)));
        }

        #[test]
        fn custom_range(range in 1i64..1000, seq in 1usize..64, seed in any::<u64>()) {
            let input = SyntheticInput::new(2, seq, range, Some(seed));
            let t = input.generate().unwrap();
            prop_assert_eq!(t.shape(), &[2, seq]);
            prop_assert!(t.as_slice::<i64>().unwrap().iter().all(|&i| (0..range).contains(&i)));
        }
    }

    #[test]
    fn seeded_is_reproducible() {
        let input = SyntheticInput::default().with_seed(7);
        assert_eq!(input.generate().unwrap(), input.generate().unwrap());
    }

    #[test]
    fn vocabulary_check() {
        let input = SyntheticInput::default();
        assert!(input.check_vocabulary(30522).is_ok());
        assert!(input.check_vocabulary(30000).is_err());
    }
}
