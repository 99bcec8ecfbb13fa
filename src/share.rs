use std::fmt;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

/// Display letter for a party: 1 → `A`, 2 → `B`, ... 26 → `Z`, then `P27`, `P28`, ...
pub fn party_label(id: u32) -> String {
    match id {
        1..=26 => char::from(b'A' + (id - 1) as u8).to_string(),
        _ => format!("P{id}"),
    }
}

/// Truncated rendering of a field element for logs: at most five leading digits.
pub fn short(value: &BigUint) -> String {
    let s = value.to_string();
    if s.len() > 5 {
        format!("{}...", &s[..5])
    } else {
        s
    }
}

/// A single share held by one party for one secret of a computation.
///
/// The share's x-coordinate is `party_id`; `value` is the y-coordinate. `name` is derived from
/// `(secret_idx, party_id)` and exists only for display and audit.
///
/// # Examples
///
/// ```rust
/// use num_bigint::BigUint;
/// use smpcnet::share::Share;
///
/// let share = Share::new(BigUint::from(1234567u32), 2, 1);
/// assert_eq!(share.name, "1_B");
/// assert_eq!(share.short(), "12345...");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    pub name: String,
    pub value: BigUint,
    pub party_id: u32,
    pub secret_idx: u32,
}

impl Share {
    pub fn new(value: BigUint, party_id: u32, secret_idx: u32) -> Self {
        Share {
            name: share_name(party_id, secret_idx),
            value,
            party_id,
            secret_idx,
        }
    }

    pub fn short(&self) -> String {
        short(&self.value)
    }
}

impl fmt::Display for Share {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.short())
    }
}

/// Deterministic share name, e.g. `2_C` for the second secret's share held by party 3.
pub fn share_name(party_id: u32, secret_idx: u32) -> String {
    format!("{secret_idx}_{}", party_label(party_id))
}

/// A participant in the computation. Identity is fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    id: u32,
    name: String,
}

impl Party {
    pub fn new(id: u32) -> Self {
        Party {
            id,
            name: format!("Party_{}", party_label(id)),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_party_label() {
        assert_eq!(party_label(1), "A");
        assert_eq!(party_label(3), "C");
        assert_eq!(party_label(26), "Z");
        assert_eq!(party_label(27), "P27");
    }

    #[test]
    fn test_share_name_is_deterministic() {
        let a = Share::new(BigUint::from(1u32), 3, 2);
        let b = Share::new(BigUint::from(999u32), 3, 2);
        assert_eq!(a.name, "2_C");
        assert_eq!(a.name, b.name);
    }

    #[test]
    fn test_short_display() {
        assert_eq!(short(&BigUint::from(42u32)), "42");
        assert_eq!(short(&BigUint::from(12345u32)), "12345");
        assert_eq!(short(&BigUint::from(123456u32)), "12345...");
        let share = Share::new(BigUint::from(9876543u32), 1, 1);
        assert_eq!(share.to_string(), "1_A: 98765...");
    }

    #[test]
    fn test_party_name() {
        let party = Party::new(2);
        assert_eq!(party.id(), 2);
        assert_eq!(party.name(), "Party_B");
        assert_eq!(party.to_string(), "Party_B");
    }
}
