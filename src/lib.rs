//! # Secure Multi-Party Summation over Shamir Secret Sharing
//!
//! This library implements a small network in which a coordinator and a fixed set of compute
//! parties jointly compute the sum of private inputs. No party (up to the configured threshold)
//! ever sees another party's input or the inputs themselves; it only ever holds one share of each.
//!
//! ## Shamir's Secret Sharing (SSS)
//!
//! Shamir's Secret Sharing is a cryptographic algorithm created by Adi Shamir. A secret is divided
//! into `n` shares such that any `t` of them reconstruct it, while `t - 1` reveal nothing about it.
//!
//! ### The Mathematics Behind SSS
//!
//! All arithmetic happens in the prime field GF(p). Given a secret `S`, the algorithm chooses a
//! random polynomial of degree `t-1`:
//!
//! ```ignore
//! f(x) = a0 + a1*x + a2*x^2 + ... + a(t-1)*x^(t-1)   (mod p)
//! ```
//!
//! where `a0 = S`, and `a1, ..., a(t-1)` are drawn uniformly from `[1, p-1]`. Party `i` receives
//! the point `(i, f(i))`. With at least `t` points the polynomial, and hence the secret, is
//! recovered by Lagrange interpolation at `x = 0`.
//!
//! ### Summing Without Revealing
//!
//! Shares are additively homomorphic: if party `i` holds `f(i)` for secret `a` and `g(i)` for
//! secret `b`, then `f(i) + g(i)` is its share of `a + b` on the polynomial `f + g`. Each party
//! therefore sums its own shares locally and reports a single value. The coordinator interpolates
//! the reported values and obtains `Σ secrets mod p` without any party revealing an input.
//!
//! ### Example: Splitting and Combining
//!
//! ```rust
//! use num_bigint::BigUint;
//! use smpcnet::sss::{create_shares, reconstruct_secret};
//!
//! let prime = BigUint::from(7919u32);
//! let points = create_shares(&BigUint::from(1234u32), 3, 5, &prime).unwrap();
//! let secret = reconstruct_secret(&points[1..4], &prime).unwrap();
//! assert_eq!(secret, BigUint::from(1234u32));
//! ```
//!
//! Reconstructing from fewer than `t` points is not an error: it returns a field element that is
//! unrelated to the secret. Threshold policy lives in the [`coordinator`].
//!
//! ## Modules
//!
//! - `sss`: Field arithmetic and Shamir sharing.
//! - `share`: Shares and parties.
//! - `node`: The compute party and its request handler.
//! - `coordinator`: Computation sessions, distribution, quorum and reconstruction.
//! - `transport`: One-message-per-connection TCP with optional mutual TLS.
//! - `protocol`: Wire messages.
//! - `repository`: Share storage for the store-then-compute flow.
//!
//! [More detailed documentation and examples are provided in each module.]

/// Shamir's Secret Sharing over a prime field: share creation, Lagrange reconstruction and the
/// homomorphic addition that makes summation possible.
pub mod sss;

/// The `share` module defines the share and party records exchanged between the coordinator and
/// the parties.
pub mod share;

/// The `node` module implements a compute party. It sums the shares it receives and reports the
/// result back to the coordinator.
pub mod node;

/// The `coordinator` module orchestrates computations: it shares the secrets out, collects partial
/// sums and reconstructs the total once a quorum has reported.
pub mod coordinator;

/// The `transport` module carries one message per TCP connection, in plaintext or over mutual TLS,
/// and retries senders until their peer is reachable.
pub mod transport;

/// Certificate and key loading for mutual TLS.
pub mod tls;

/// The `protocol` module defines the request and response messages and their CBOR encoding.
pub mod protocol;

/// The `repository` module stores share bundles by computation id, in memory or in sled.
pub mod repository;

/// The `config` module loads node and controller settings from `conf.toml` and `SMPC_*` variables.
pub mod config;

/// The `error` module defines the crate-wide error type.
pub mod error;

pub use error::{Error, Result};
