//! The `mutator` module generates "similar password" variants, which are
//! stored next to real breach entries as decoys.

use std::collections::HashSet;

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::errors::{C3Error, Result};

/// The `Mutator` trait produces `count` variants of a secret. Variants
/// must differ from the secret and from each other.
pub trait Mutator: Send + Sync {
  fn mutate(&self, secret: &[u8], count: usize) -> Result<Vec<Vec<u8>>>;
}

const LEET: [(u8, u8); 6] = [
  (b'a', b'@'),
  (b'e', b'3'),
  (b'i', b'1'),
  (b'o', b'0'),
  (b's', b'$'),
  (b't', b'7'),
];
const SYMBOLS: &[u8] = b"!@#$%&*?";
const MAX_RULES_PER_VARIANT: usize = 3;
// Rule draws per requested variant before falling back to numbered
// suffixes
const DRAWS_PER_VARIANT: usize = 16;

#[derive(Clone, Copy, Debug)]
enum Rule {
  CapitalizeFirst,
  ToggleCase,
  Leet,
  Reverse,
  AppendDigit,
  AppendSymbol,
  PrependDigit,
  DeleteLast,
  Duplicate,
}
const RULES: [Rule; 9] = [
  Rule::CapitalizeFirst,
  Rule::ToggleCase,
  Rule::Leet,
  Rule::Reverse,
  Rule::AppendDigit,
  Rule::AppendSymbol,
  Rule::PrependDigit,
  Rule::DeleteLast,
  Rule::Duplicate,
];

impl Rule {
  fn apply<R: Rng>(self, pw: &mut Vec<u8>, rng: &mut R) {
    match self {
      Rule::CapitalizeFirst => {
        if let Some(c) = pw.first_mut() {
          *c = c.to_ascii_uppercase();
        }
      }
      Rule::ToggleCase => {
        for c in pw.iter_mut() {
          if c.is_ascii_lowercase() {
            *c = c.to_ascii_uppercase();
          } else if c.is_ascii_uppercase() {
            *c = c.to_ascii_lowercase();
          }
        }
      }
      Rule::Leet => {
        for c in pw.iter_mut() {
          if let Some(&(_, to)) = LEET.iter().find(|(from, _)| from == c) {
            *c = to;
          }
        }
      }
      Rule::Reverse => pw.reverse(),
      Rule::AppendDigit => pw.push(b'0' + rng.gen_range(0..10)),
      Rule::AppendSymbol => pw.push(SYMBOLS[rng.gen_range(0..SYMBOLS.len())]),
      Rule::PrependDigit => pw.insert(0, b'0' + rng.gen_range(0..10)),
      Rule::DeleteLast => {
        pw.pop();
      }
      Rule::Duplicate => {
        let copy = pw.clone();
        pw.extend(copy);
      }
    }
  }
}

/// Rule-based mutator in the style of the transformation rules users
/// apply when reusing passwords (capitalization, leetspeak, digit and
/// symbol suffixes, ...).
pub struct RuleMutator {
  rng: Mutex<SmallRng>,
}
impl RuleMutator {
  pub fn new() -> Self {
    Self {
      rng: Mutex::new(SmallRng::from_entropy()),
    }
  }

  /// A mutator whose output only depends on `seed` and its inputs
  pub fn seeded(seed: u64) -> Self {
    Self {
      rng: Mutex::new(SmallRng::seed_from_u64(seed)),
    }
  }
}
impl Default for RuleMutator {
  fn default() -> Self {
    Self::new()
  }
}

impl Mutator for RuleMutator {
  fn mutate(&self, secret: &[u8], count: usize) -> Result<Vec<Vec<u8>>> {
    let mut rng = self.rng.lock();
    let mut seen: HashSet<Vec<u8>> = HashSet::with_capacity(count + 1);
    seen.insert(secret.to_vec());
    let mut variants = Vec::with_capacity(count);

    let mut draws = count.saturating_mul(DRAWS_PER_VARIANT);
    while variants.len() < count && draws > 0 {
      draws -= 1;
      let mut candidate = secret.to_vec();
      for _ in 0..rng.gen_range(1..=MAX_RULES_PER_VARIANT) {
        RULES[rng.gen_range(0..RULES.len())].apply(&mut candidate, &mut *rng);
      }
      if seen.insert(candidate.clone()) {
        variants.push(candidate);
      }
    }

    let mut suffix = 0u64;
    while variants.len() < count {
      let mut candidate = secret.to_vec();
      candidate.extend_from_slice(suffix.to_string().as_bytes());
      suffix = suffix.checked_add(1).ok_or_else(|| {
        C3Error::Mutation("exhausted numbered suffixes".into())
      })?;
      if seen.insert(candidate.clone()) {
        variants.push(candidate);
      }
    }
    Ok(variants)
  }
}
