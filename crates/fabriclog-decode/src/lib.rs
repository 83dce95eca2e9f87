//! fabriclog-decode — turns delivered Fabric blocks into JSON-safe records.
//!
//! Every decode step is an explicit function returning `Result` or a
//! fallback value, so one malformed transaction degrades to text/hex
//! instead of aborting the rest of the block.
//!
//! ```text
//! Block ──► records::decode_block
//!             ├── decoder::classify_header_extension   (ChaincodeAction | text | raw)
//!             ├── decoder::rewrite_invocation_inputs   (lifecycle "deploy" special case)
//!             └── convert::convert_buffers             (RawNode → serde_json::Value)
//! ```

pub mod convert;
pub mod decoder;
pub mod protos;
pub mod records;

pub use convert::{convert_buffers, is_likely_text, to_hex_or_text, to_text, HexOrText};
pub use decoder::{
    classify_header_extension, decode_chaincode_action, decode_deployment_spec,
    decode_invocation_arguments, decode_signature_policy, is_signature_policy_envelope,
    rewrite_invocation_inputs, text_or_raw, Extension,
};
pub use records::{decode_block, decode_chaincode_event};
