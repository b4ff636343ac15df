//! Tree folding
//!
//! Combines child samples into the sample a parent sends further up, and
//! splits a parent policy across its children.

use crate::error::{Error, Result};
use powertree_common::{is_policy_equal, PolicyMessage, SampleMessage, INVALID_SAMPLE};

/// Fold child samples of one region into a single sample.
///
/// Runtime is the slowest child, energy the sum, frequency the mean. Invalid
/// children are skipped; with no valid child the result is
/// [`INVALID_SAMPLE`].
pub fn fold_samples(children: &[SampleMessage]) -> Result<SampleMessage> {
    let mut valid = children.iter().filter(|s| !s.is_invalid());
    let Some(first) = valid.next() else {
        return Ok(INVALID_SAMPLE);
    };

    let mut folded = *first;
    let mut count = 1.0;
    for child in valid {
        if child.region_id != first.region_id {
            return Err(Error::RegionMismatch {
                expected: first.region_id,
                found: child.region_id,
            });
        }
        folded.runtime = folded.runtime.max(child.runtime);
        folded.energy += child.energy;
        folded.frequency += child.frequency;
        count += 1.0;
    }
    folded.frequency /= count;
    Ok(folded)
}

/// Equal share of `parent`'s budget for each of `num_children` children.
///
/// A non-positive budget (no budget decided) is passed through unchanged.
pub fn split_policy(parent: &PolicyMessage, num_children: usize) -> Vec<PolicyMessage> {
    let mut child = *parent;
    if num_children > 0 && parent.power_budget > 0.0 {
        child.power_budget = parent.power_budget / num_children as f64;
    }
    vec![child; num_children]
}

/// Suppresses redundant downward propagation
#[derive(Debug, Default)]
pub struct PolicyRelay {
    last: Option<PolicyMessage>,
}

impl PolicyRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `policy` must be sent to the children. Remembers it if so.
    pub fn relay(&mut self, policy: &PolicyMessage) -> bool {
        match &self.last {
            Some(last) if is_policy_equal(last, policy) => false,
            _ => {
                self.last = Some(*policy);
                true
            }
        }
    }

    pub fn last(&self) -> Option<&PolicyMessage> {
        self.last.as_ref()
    }

    /// Forget the last policy so the next one is always sent
    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use powertree_common::{PolicyFlags, PolicyMode};

    #[test]
    fn test_fold_samples() {
        let children = [
            SampleMessage::new(4, 0x10, 2.0, 100.0, 2.0e9),
            SampleMessage::new(5, 0x10, 3.0, 150.0, 3.0e9),
            INVALID_SAMPLE,
        ];
        let folded = fold_samples(&children).unwrap();
        assert_eq!(folded.rank, 4);
        assert_eq!(folded.region_id, 0x10);
        assert_eq!(folded.runtime, 3.0);
        assert_eq!(folded.energy, 250.0);
        assert_eq!(folded.frequency, 2.5e9);
    }

    #[test]
    fn test_fold_empty_and_mismatch() {
        assert!(fold_samples(&[]).unwrap().is_invalid());
        let children = [
            SampleMessage::new(0, 1, 1.0, 1.0, 1.0),
            SampleMessage::new(1, 2, 1.0, 1.0, 1.0),
        ];
        assert!(matches!(
            fold_samples(&children),
            Err(Error::RegionMismatch { expected: 1, found: 2 })
        ));
    }

    #[test]
    fn test_split_policy() {
        let parent = PolicyMessage::new(0, PolicyMode::FreqUniformStatic, PolicyFlags::from_bits(18), 1, 75500.0);
        let children = split_policy(&parent, 4);
        assert_eq!(children.len(), 4);
        assert!(children.iter().all(|c| c.power_budget == 18875.0 && c.flags == 18));
        assert!(split_policy(&parent, 0).is_empty());
    }

    #[test]
    fn test_relay_suppresses_repeats() {
        let mut relay = PolicyRelay::new();
        let a = PolicyMessage::new(0, PolicyMode::TdpBalanceStatic, PolicyFlags::default(), 1, 100.0);
        let mut b = a;
        b.power_budget = 90.0;

        assert!(relay.relay(&a));
        assert!(!relay.relay(&a));
        assert!(relay.relay(&b));
        assert_eq!(relay.last(), Some(&b));
        relay.reset();
        assert!(relay.relay(&b));
    }
}
