//! v3 onion service client
//!
//! Everything needed to reach a `.onion` address: address decoding, time
//! period key blinding, HSDir ring selection, descriptor fetch and
//! two-layer decryption, the hs-ntor handshake, and the rendezvous /
//! introduction choreography that ends with a virtual hop on the
//! rendezvous circuit.

mod address;
mod blind;
pub mod connect;
mod descriptor;
mod hsdir;
mod hsntor;

pub use address::{decode_onion, encode_onion, is_onion_address};
pub use blind::{blind_public_key, srv_for_client, subcredential, time_period};
pub use connect::{connect_onion_service, BuiltCircuit, CircuitBuilder, DirHttpClient};
pub use descriptor::{DescriptorOuter, IntroPoint};
pub use hsdir::select_hsdirs;
