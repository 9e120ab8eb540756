//! ESS — EEPROM Section System: a power-fail-safe, content-addressed storage
//! engine for small byte-addressable non-volatile media (`spec.md` §1/§2).
//!
//! The engine is assembled from the components specified in `spec.md` §4:
//! block-level access and validation (`block`), free-list bookkeeping
//! (`free_list`), section-head search primitives (`search`), the mount/repair
//! state machine (`mount`), the section reader/writer streams (`reader`,
//! `writer`, and the narrow `stream` traits they implement), a named
//! read/write lock registry (`lock`), and the top-level coordinator
//! (`engine`) that wires all of the above behind one mutex.

pub mod block;
pub mod engine;
pub mod error;
pub mod free_list;
pub mod lock;
pub mod mount;
pub mod reader;
pub mod search;
pub mod stream;
pub mod writer;

pub use block::{hash_name, BlockType, HEAD_NAME_OVERHEAD, NOBLOCK, SECTION_SYSTEM_VERSION};
pub use engine::{Engine, EngineState};
pub use error::{EssError, EssResult};
pub use reader::SectionReader;
pub use stream::{RemainingBitsExpectation, StreamReader, StreamWriter};
pub use writer::SectionWriter;
