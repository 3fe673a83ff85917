//! Per-shot rendering of the engine XML input deck
//!
//! The base deck is streamed through unchanged except for:
//!   Events@maxTime
//!   AcousticSEM@sourceCoordinates, @receiverCoordinates, @dtSeismoTrace
//!   Outputs/*@plotFileRoot (suffixed with the shot id)

use anyhow::{Context, Result};
use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesStart, Event};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::acquisition::{Point3, Shot};
use crate::config::{ACOUSTIC_SOLVER_ELEMENT, SHOT_XML_DIR};

/// Values substituted into the deck for one shot
#[derive(Debug, Clone)]
pub struct ShotDeck<'a> {
    pub shot: &'a Shot,
    pub max_time: f64,
    pub dt_seismo_trace: f64,
}

/// Format points the way the engine expects arrays of coordinates: `{ { x, y, z }, ... }`
pub fn format_coordinates(points: &[Point3]) -> String {
    let inner: Vec<String> = points
        .iter()
        .map(|p| format!("{{ {}, {}, {} }}", p[0], p[1], p[2]))
        .collect();
    format!("{{ {} }}", inner.join(", "))
}

/// Render the per-shot deck from the base deck contents
pub fn render_shot_xml(base: &str, deck: &ShotDeck<'_>) -> Result<String> {
    let mut reader = Reader::from_str(base);
    let mut writer = Writer::new(Vec::new());
    let mut path: Vec<String> = Vec::new();

    loop {
        let event = reader
            .read_event()
            .with_context(|| format!("Malformed XML at byte {}", reader.buffer_position()))?;

        match event {
            Event::Eof => break,
            Event::Start(e) => {
                let name = element_name(&e)?;
                let rewritten = rewrite_element(&e, &name, &path, deck)?;
                writer
                    .write_event(Event::Start(rewritten))
                    .context("Failed to write XML element")?;
                path.push(name);
            }
            Event::Empty(e) => {
                let name = element_name(&e)?;
                let rewritten = rewrite_element(&e, &name, &path, deck)?;
                writer
                    .write_event(Event::Empty(rewritten))
                    .context("Failed to write XML element")?;
            }
            Event::End(e) => {
                path.pop();
                writer
                    .write_event(Event::End(e))
                    .context("Failed to write XML element")?;
            }
            other => writer
                .write_event(other)
                .context("Failed to write XML content")?,
        }
    }

    String::from_utf8(writer.into_inner()).context("Rendered XML is not valid UTF-8")
}

/// Location of the rendered deck of a shot
pub fn shot_xml_path(out_dir: &Path, shot_id: &str) -> PathBuf {
    out_dir.join(SHOT_XML_DIR).join(format!("shot_{}.xml", shot_id))
}

/// Render the deck of `deck.shot` from `base_path` into `<out_dir>/xml/shot_<id>.xml`
pub async fn write_shot_xml(base_path: &Path, out_dir: &Path, deck: &ShotDeck<'_>) -> Result<PathBuf> {
    let base = fs::read_to_string(base_path)
        .await
        .with_context(|| format!("Failed to read engine XML {}", base_path.display()))?;

    let rendered = render_shot_xml(&base, deck)
        .with_context(|| format!("Failed to render XML for shot {}", deck.shot.id))?;

    let path = shot_xml_path(out_dir, &deck.shot.id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .context("Failed to create per-shot XML directory")?;
    }

    fs::write(&path, rendered)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;

    Ok(path)
}

fn element_name(e: &BytesStart<'_>) -> Result<String> {
    Ok(std::str::from_utf8(e.name().as_ref())
        .context("Element name is not valid UTF-8")?
        .to_string())
}

fn rewrite_element(
    e: &BytesStart<'_>,
    name: &str,
    path: &[String],
    deck: &ShotDeck<'_>,
) -> Result<BytesStart<'static>> {
    if name == "Events" {
        let max_time = deck.max_time.to_string();
        return rewrite_attributes(e, name, &[("maxTime", max_time)], true);
    }

    if name == ACOUSTIC_SOLVER_ELEMENT {
        let substitutions = [
            ("sourceCoordinates", format_coordinates(&[deck.shot.source])),
            ("receiverCoordinates", format_coordinates(&deck.shot.receivers)),
            ("dtSeismoTrace", deck.dt_seismo_trace.to_string()),
        ];
        return rewrite_attributes(e, name, &substitutions, true);
    }

    if path.last().is_some_and(|parent| parent == "Outputs") {
        let root = e
            .try_get_attribute("plotFileRoot")
            .context("Invalid attribute on output element")?
            .map(|attr| attr.unescape_value().map(|v| v.into_owned()))
            .transpose()
            .context("Invalid plotFileRoot value")?;
        if let Some(root) = root {
            let suffixed = format!("{}_{}", root, deck.shot.id);
            return rewrite_attributes(e, name, &[("plotFileRoot", suffixed)], false);
        }
    }

    Ok(e.clone().into_owned())
}

/// Copy `e`, replacing the listed attributes. Missing ones are appended when
/// `append_missing` is set.
fn rewrite_attributes(
    e: &BytesStart<'_>,
    name: &str,
    substitutions: &[(&str, String)],
    append_missing: bool,
) -> Result<BytesStart<'static>> {
    let mut out = BytesStart::new(name.to_string());
    let mut seen = HashSet::new();

    for attr in e.attributes() {
        let attr = attr.with_context(|| format!("Invalid attribute on <{}>", name))?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .context("Attribute name is not valid UTF-8")?
            .to_string();

        match substitutions.iter().find(|(k, _)| *k == key) {
            Some((k, value)) => {
                out.push_attribute((*k, value.as_str()));
                seen.insert(*k);
            }
            None => out.push_attribute(attr),
        }
    }

    if append_missing {
        for (k, value) in substitutions {
            if !seen.contains(k) {
                out.push_attribute((*k, value.as_str()));
            }
        }
    }

    Ok(out)
}
