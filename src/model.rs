//! Entities that flow through one pipeline run.
//!
//! ```text
//! SourceDocument ─▶ PageImage ─▶ PreprocessedImage ─▶ PageText ─┬─▶ Chunk ─▶ EmbeddedChunk
//!                                                      ParsedInfo ┘
//! ```
//!
//! Everything up to [`Chunk`] is owned by a single run and dropped when the
//! run ends. [`Chunk::chunk_id`] is the only identity that outlives the run:
//! it is the upsert key of the vector store.

use crate::error::{PageError, PipelineError};
use image::{DynamicImage, GrayImage};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Uploaded PDF bytes plus their logical identity.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    file_id: String,
    filename: Option<String>,
    bytes: Arc<[u8]>,
}

impl SourceDocument {
    /// Wrap a payload; `file_id` is the hex SHA-256 of the bytes.
    pub fn new(bytes: impl Into<Arc<[u8]>>, filename: Option<String>) -> Self {
        let bytes = bytes.into();
        let file_id = hex::encode(Sha256::digest(&*bytes));
        Self {
            file_id,
            filename,
            bytes,
        }
    }

    /// Replace the content-derived identity with a caller-chosen one.
    pub fn with_file_id(mut self, file_id: impl Into<String>) -> Self {
        self.file_id = file_id.into();
        self
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Cheap handle on the payload for moving into blocking tasks.
    pub fn shared_bytes(&self) -> Arc<[u8]> {
        Arc::clone(&self.bytes)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// One rasterised page.
#[derive(Debug, Clone)]
pub struct PageImage {
    /// 0-based position in the document.
    pub page_index: usize,
    pub image: DynamicImage,
}

/// A restored page: single channel, every pixel is 0 or 255.
#[derive(Debug, Clone)]
pub struct PreprocessedImage {
    pub page_index: usize,
    pub image: GrayImage,
}

/// Raw transcription of one page.
///
/// `text` is empty when extraction failed; `error` then says why.
#[derive(Debug, Clone, PartialEq)]
pub struct PageText {
    pub page_index: usize,
    pub text: String,
    pub error: Option<PageError>,
}

impl PageText {
    pub fn ok(page_index: usize, text: impl Into<String>) -> Self {
        Self {
            page_index,
            text: text.into(),
            error: None,
        }
    }

    pub fn failed(page_index: usize, error: PageError) -> Self {
        Self {
            page_index,
            text: String::new(),
            error: Some(error),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Outcome of extracting one field.
///
/// `Absent` means the field was not found (or the key was missing / null in
/// the model's answer). `Blank` means the model returned the key with an
/// empty value. Serialised as `null`, `""` and the value respectively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extracted<T> {
    Absent,
    Blank,
    Present(T),
}

impl<T> Default for Extracted<T> {
    fn default() -> Self {
        Extracted::Absent
    }
}

impl<T> Extracted<T> {
    pub fn is_present(&self) -> bool {
        matches!(self, Extracted::Present(_))
    }

    pub fn as_option(&self) -> Option<&T> {
        match self {
            Extracted::Present(v) => Some(v),
            _ => None,
        }
    }
}

impl<T: DeserializeOwned> Extracted<T> {
    /// Interpret one JSON value from a field-extraction answer.
    ///
    /// Empty strings, whitespace-only strings and empty arrays are `Blank`;
    /// a value of the wrong type is treated as `Absent`.
    pub fn from_json(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => Extracted::Absent,
            Some(Value::String(s)) if s.trim().is_empty() => Extracted::Blank,
            Some(Value::Array(a)) if a.is_empty() => Extracted::Blank,
            Some(v) => serde_json::from_value(v.clone())
                .map(Extracted::Present)
                .unwrap_or(Extracted::Absent),
        }
    }
}

impl<T: Serialize> Serialize for Extracted<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Extracted::Absent => serializer.serialize_none(),
            Extracted::Blank => serializer.serialize_str(""),
            Extracted::Present(v) => v.serialize(serializer),
        }
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for Extracted<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(Extracted::from_json(Some(&value)))
    }
}

/// Structured fields extracted from one page.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParsedInfo {
    #[serde(default)]
    pub client_name: Extracted<String>,
    #[serde(default)]
    pub document_date: Extracted<String>,
    #[serde(default)]
    pub signature_found: Extracted<bool>,
    #[serde(default)]
    pub relevant_illness_mentions: Extracted<Vec<String>>,
}

impl ParsedInfo {
    /// Build from the JSON object returned by the field-extraction model.
    /// Unknown keys are ignored.
    pub fn from_json_object(obj: &Map<String, Value>) -> Self {
        Self {
            client_name: Extracted::from_json(obj.get("client_name")),
            document_date: Extracted::from_json(obj.get("document_date")),
            signature_found: Extracted::from_json(obj.get("signature_found")),
            relevant_illness_mentions: Extracted::from_json(obj.get("relevant_illness_mentions")),
        }
    }

    /// True when no field was found at all.
    pub fn is_empty(&self) -> bool {
        !self.client_name.is_present()
            && !self.document_date.is_present()
            && !self.signature_found.is_present()
            && !self.relevant_illness_mentions.is_present()
    }
}

/// Deterministic identity of a chunk: hex SHA-256 of
/// `file_id | page_index | chunk_index`, first 32 characters.
///
/// The ordinal, not the character offset, is hashed: a re-transcribed page
/// whose text shifted by a few characters keeps the ids of its chunks.
pub fn chunk_id(file_id: &str, page_index: usize, chunk_index: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_id.as_bytes());
    hasher.update(b"|");
    hasher.update(page_index.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(chunk_index.to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..32].to_string()
}

/// One retrieval unit, before embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub file_id: String,
    pub page_index: usize,
    /// 0-based position among this page's chunks.
    pub chunk_index: usize,
    /// Character offset of the chunk start within the cleaned page text.
    pub char_offset: usize,
    pub text: String,
    pub metadata: Value,
}

/// A chunk and its vector. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedChunk {
    chunk: Chunk,
    embedding: Vec<f32>,
}

impl EmbeddedChunk {
    /// Pair a chunk with its vector, refusing vectors of the wrong length.
    pub fn new(chunk: Chunk, embedding: Vec<f32>, dimension: usize) -> Result<Self, PipelineError> {
        if embedding.len() != dimension {
            return Err(PipelineError::DimensionMismatch {
                chunk_id: chunk.chunk_id,
                expected: dimension,
                actual: embedding.len(),
            });
        }
        Ok(Self { chunk, embedding })
    }

    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }

    pub fn chunk_id(&self) -> &str {
        &self.chunk.chunk_id
    }

    pub fn embedding(&self) -> &[f32] {
        &self.embedding
    }
}
