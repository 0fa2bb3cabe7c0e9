//! Label table carried in a NIfTI extension.
//!
//! Multilabel segmentations embed their label names as a Caret XML document
//! (`<CaretExtension>...<LabelTable><Label Key="1">spleen</Label>...`).

use std::collections::BTreeMap;
use std::fmt::Write as _;

use quick_xml::Reader;
use quick_xml::events::Event;
use serde::{Deserialize, Serialize};

use super::error::{CodecError, CodecResult};

/// Extension code used when writing the label table.
pub const LABEL_TABLE_ECODE: i32 = 0;

/// Mapping from label id to anatomical name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelMap(BTreeMap<u32, String>);

impl LabelMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: u32, name: impl Into<String>) -> Option<String> {
        self.0.insert(id, name.into())
    }

    pub fn get(&self, id: u32) -> Option<&str> {
        self.0.get(&id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> {
        self.0.iter().map(|(id, name)| (*id, name.as_str()))
    }

    /// Whether an extension payload looks like a label table.
    pub fn is_label_table(payload: &[u8]) -> bool {
        payload
            .windows(b"<CaretExtension".len())
            .any(|w| w == b"<CaretExtension")
    }

    /// Parse a Caret XML label table.
    pub fn from_caret_xml(xml: &str) -> CodecResult<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut labels = LabelMap::new();
        let mut current: Option<(u32, String)> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) if e.name().as_ref() == b"Label" => {
                    let key = e
                        .try_get_attribute("Key")
                        .map_err(|err| CodecError::MalformedLabelMap(err.to_string()))?
                        .ok_or_else(|| {
                            CodecError::MalformedLabelMap("label without Key".to_string())
                        })?;
                    let key = key
                        .unescape_value()
                        .map_err(|err| CodecError::MalformedLabelMap(err.to_string()))?;
                    let id = key.trim().parse::<u32>().map_err(|_| {
                        CodecError::MalformedLabelMap(format!("invalid label key: {key}"))
                    })?;
                    current = Some((id, String::new()));
                }
                Ok(Event::Text(t)) => {
                    if let Some((_, name)) = current.as_mut() {
                        let text = t
                            .unescape()
                            .map_err(|err| CodecError::MalformedLabelMap(err.to_string()))?;
                        name.push_str(&text);
                    }
                }
                Ok(Event::CData(c)) => {
                    if let Some((_, name)) = current.as_mut() {
                        let text = std::str::from_utf8(&c)
                            .map_err(|err| CodecError::MalformedLabelMap(err.to_string()))?;
                        name.push_str(text);
                    }
                }
                Ok(Event::End(e)) if e.name().as_ref() == b"Label" => {
                    if let Some((id, name)) = current.take() {
                        labels.insert(id, name.trim());
                    }
                }
                Ok(Event::Eof) => break,
                Err(err) => {
                    return Err(CodecError::MalformedLabelMap(format!(
                        "at byte {}: {err}",
                        reader.error_position()
                    )));
                }
                _ => {}
            }
        }

        if current.is_some() {
            return Err(CodecError::MalformedLabelMap("unterminated label".to_string()));
        }

        Ok(labels)
    }

    /// Render the label table as a Caret XML document.
    pub fn to_caret_xml(&self) -> String {
        let mut xml = String::from(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<CaretExtension>\n  <VolumeInformation Index=\"0\">\n    <LabelTable>\n",
        );
        for (id, name) in self.iter() {
            let [red, green, blue] = label_color(id);
            // CDATA cannot contain its own terminator
            let name = name.replace("]]>", "]]]]><![CDATA[>");
            let _ = writeln!(
                xml,
                "      <Label Key=\"{id}\" Red=\"{red:.3}\" Green=\"{green:.3}\" Blue=\"{blue:.3}\" Alpha=\"1\"><![CDATA[{name}]]></Label>"
            );
        }
        xml.push_str(
            "    </LabelTable>\n    <VolumeType><![CDATA[Label]]></VolumeType>\n  </VolumeInformation>\n</CaretExtension>\n",
        );
        xml
    }
}

impl FromIterator<(u32, String)> for LabelMap {
    fn from_iter<I: IntoIterator<Item = (u32, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Stable display color for a label id.
fn label_color(id: u32) -> [f32; 3] {
    let hash = id.wrapping_mul(2_654_435_761);
    [
        (hash & 0xff) as f32 / 255.0,
        ((hash >> 8) & 0xff) as f32 / 255.0,
        ((hash >> 16) & 0xff) as f32 / 255.0,
    ]
}
