//! Tor onion-routing client protocol engine
//!
//! Implements the client side of the Tor link, circuit, and stream
//! protocols: the cell codec, the TLS link handshake with Ed25519
//! certificate binding, ntor key agreement, multi-hop onion encryption
//! with running-digest authentication, SENDME flow control, stream
//! multiplexing, and the v3 onion service rendezvous protocol.
//!
//! The crate deliberately stops at the protocol boundary. Directory
//! bootstrap, path selection, and the SOCKS front-end are collaborators:
//! they feed in a [`Consensus`] and chosen relays, and get back circuits
//! and streams.
//!
//! ```no_run
//! use tor_core::{Circuit, Link, Stream};
//! # async fn demo(guard: tor_core::RelayInfo, middle: tor_core::RelayInfo,
//! #               exit: tor_core::RelayInfo) -> tor_core::Result<()> {
//! let link = Link::handshake(guard.addr()).await?;
//! let circuit = Circuit::create(link, &guard).await?;
//! circuit.extend(&middle).await?;
//! circuit.extend(&exit).await?;
//!
//! let mut stream = Stream::begin(&circuit, "example.com:80").await?;
//! stream.write(b"GET / HTTP/1.0\r\n\r\n").await?;
//! # Ok(())
//! # }
//! ```

pub mod cell;
pub mod certs;
pub mod circuit;
pub mod consensus;
pub mod crypto;
pub mod error;
mod flow;
pub mod link;
pub mod ntor;
pub mod onion;
pub mod stream;

pub use circuit::{Circuit, RelayMsg};
pub use consensus::{Consensus, Relay, RelayFlags, RelayInfo};
pub use error::{Error, Result};
pub use link::Link;
pub use onion::{connect_onion_service, BuiltCircuit, CircuitBuilder, DirHttpClient};
pub use stream::Stream;
