//! Three-way reconciliation
//!
//! Every identity in `last ∪ a ∪ b` is classified by its membership
//! pattern:
//!
//! | in A | in B | in last | action          |
//! |------|------|---------|-----------------|
//! | 1    | 0    | 0       | copy A to B     |
//! | 0    | 1    | 0       | copy B to A     |
//! | 1    | 1    | x       | keep            |
//! | 1    | 0    | 1       | remove from A   |
//! | 0    | 1    | 1       | remove from B   |
//! | 0    | 0    | 1       | drop            |

use crate::identity::MessageIdentity;
use std::collections::BTreeSet;

/// What happens to one identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    CopyAToB,
    CopyBToA,
    Keep,
    RemoveFromA,
    RemoveFromB,
    /// Deleted on both sides
    Drop,
}

impl Action {
    /// Action for a membership pattern; `None` only for (0, 0, 0)
    pub fn for_membership(in_a: bool, in_b: bool, in_last: bool) -> Option<Action> {
        match (in_a, in_b, in_last) {
            (true, false, false) => Some(Action::CopyAToB),
            (false, true, false) => Some(Action::CopyBToA),
            (true, true, _) => Some(Action::Keep),
            (true, false, true) => Some(Action::RemoveFromA),
            (false, true, true) => Some(Action::RemoveFromB),
            (false, false, true) => Some(Action::Drop),
            (false, false, false) => None,
        }
    }
}

/// Action sets for one mailbox
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub copy_a_to_b: BTreeSet<MessageIdentity>,
    pub copy_b_to_a: BTreeSet<MessageIdentity>,
    pub remove_a: BTreeSet<MessageIdentity>,
    pub remove_b: BTreeSet<MessageIdentity>,
    /// Present on both sides
    pub keep: BTreeSet<MessageIdentity>,
}

impl Classification {
    /// Whether nothing needs to be transferred or removed
    pub fn is_quiet(&self) -> bool {
        self.copy_a_to_b.is_empty()
            && self.copy_b_to_a.is_empty()
            && self.remove_a.is_empty()
            && self.remove_b.is_empty()
    }

    /// The new state if every copy succeeds
    pub fn projected_now(&self) -> BTreeSet<MessageIdentity> {
        self.keep
            .iter()
            .chain(self.copy_a_to_b.iter())
            .chain(self.copy_b_to_a.iter())
            .cloned()
            .collect()
    }
}

/// Classify every identity referenced by the three sets
pub fn classify(
    last: &BTreeSet<MessageIdentity>,
    now_a: &BTreeSet<MessageIdentity>,
    now_b: &BTreeSet<MessageIdentity>,
) -> Classification {
    let mut result = Classification::default();
    let universe: BTreeSet<&MessageIdentity> =
        last.iter().chain(now_a.iter()).chain(now_b.iter()).collect();

    for identity in universe {
        let action = Action::for_membership(
            now_a.contains(identity),
            now_b.contains(identity),
            last.contains(identity),
        );
        let target = match action {
            Some(Action::CopyAToB) => &mut result.copy_a_to_b,
            Some(Action::CopyBToA) => &mut result.copy_b_to_a,
            Some(Action::Keep) => &mut result.keep,
            Some(Action::RemoveFromA) => &mut result.remove_a,
            Some(Action::RemoveFromB) => &mut result.remove_b,
            Some(Action::Drop) => continue,
            None => unreachable!("identity {} is in none of the sets it was drawn from", identity),
        };
        target.insert(identity.clone());
    }
    result
}
