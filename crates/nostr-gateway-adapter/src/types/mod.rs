/*
[INPUT]:  Protocol schema definitions and serde requirements
[OUTPUT]: Typed Rust structs/enums with serialization support
[POS]:    Data layer - keys, events, identity and wallet records
[UPDATE]: When event layouts change or new types added
*/

pub mod enums;
pub mod event;
pub mod identity;
pub mod wallet;

pub use enums::*;
pub use event::*;
pub use identity::*;
pub use wallet::*;
