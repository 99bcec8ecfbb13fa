use num_bigint::BigUint;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::share::Share;

/// Upper bound on a single encoded message. Anything larger is rejected by the listener.
pub const MAX_MESSAGE_BYTES: usize = 1 << 20;

/// Represents a request sent from the coordinator to a compute node.
///
/// Requests are internally tagged by an `action` field, so the decoder checks both the
/// discriminant and every declared field type before a handler ever sees the message.
///
/// # Variants
///
/// * `ComputeSum` - Shares and prime travel together; the node replies with its local sum.
/// * `StoreShares` - Stores a bundle under a computation id for a later `ComputeStored`.
/// * `ComputeStored` - Sums a previously stored bundle.
/// * `Clear` - Forgets everything stored under a computation id.
///
/// # Examples
///
/// ```rust
/// use num_bigint::BigUint;
/// use smpcnet::protocol::Request;
/// use smpcnet::share::Share;
///
/// let request = Request::ComputeSum {
///     computation_id: "job-1".to_string(),
///     shares: vec![Share::new(BigUint::from(17u32), 1, 1)],
///     prime: BigUint::from(7919u32),
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    ComputeSum {
        computation_id: String,
        shares: Vec<Share>,
        prime: BigUint,
    },
    StoreShares {
        computation_id: String,
        shares: Vec<Share>,
    },
    ComputeStored {
        computation_id: String,
        prime: BigUint,
    },
    Clear {
        computation_id: String,
    },
}

impl Request {
    pub fn computation_id(&self) -> &str {
        match self {
            Request::ComputeSum { computation_id, .. }
            | Request::StoreShares { computation_id, .. }
            | Request::ComputeStored { computation_id, .. }
            | Request::Clear { computation_id } => computation_id,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Request::ComputeSum { .. } => "compute_sum",
            Request::StoreShares { .. } => "store_shares",
            Request::ComputeStored { .. } => "compute_stored",
            Request::Clear { .. } => "clear",
        }
    }
}

/// Represents a node's report back to the coordinator.
///
/// The computation id is carried so the coordinator can route the partial sum to the right
/// session when several computations run at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Response {
    PartialSum {
        computation_id: String,
        party_id: u32,
        sum: BigUint,
    },
}

/// Encodes a message as CBOR.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let bytes = serde_cbor::to_vec(message)?;
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(Error::Codec(format!(
            "encoded message is {} bytes, limit is {MAX_MESSAGE_BYTES}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Decodes a CBOR message into the expected type.
///
/// Unknown actions, missing fields and mistyped fields are all rejected here.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    if bytes.is_empty() {
        return Err(Error::Codec("empty message".to_string()));
    }
    Ok(serde_cbor::from_slice(bytes)?)
}
