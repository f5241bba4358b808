//! URL path codec: parsing, generation and signing.
//!
//! Request paths have the shape `[SIG/]<operations...>/<image>` where the
//! operations are slash-separated tokens:
//!
//! ```text
//! path       := [signature "/"] ["meta/"] ["trim[:side]/"] ["fit-in/"]
//!               [dimensions "/"] [halign "/"] [valign "/"] ["smart/"]
//!               ["filters:" filter ("," filter)* "/"] image
//! dimensions := [-]W "x" [-]H
//! filter     := name "(" args ")"
//! signature  := base64url-encoded HMAC over the remainder of the path
//! ```
//!
//! The parser is total: tokens it does not recognize stay in
//! [`Params::path`] verbatim and flow into the image identifier. The
//! reserved segment `unsafe` replaces the signature in unsafe mode and is
//! rejected as an invalid signature otherwise.

mod generate;
mod params;
mod parse;
mod signer;

pub use generate::generate;
pub use params::{Filter, Params};
pub use parse::{parse, MIN_SIGNATURE_LEN};
pub use signer::{HmacSigner, Signer, SignerAlg};
