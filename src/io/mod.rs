//! File interchange: JSON checkpoints and engine XML decks

pub mod json;
pub mod xml;

pub use json::{from_json_file, from_json_generic, to_json_file, to_record};
pub use xml::{ShotDeck, shot_xml_path, write_shot_xml};
