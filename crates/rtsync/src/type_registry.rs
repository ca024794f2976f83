//! Document and file types known to the engine
//!
//! Every collection a service touches must be registered up front; the
//! registration decides the OT type of new documents and which data paths
//! the local store indexes.

use serde_json::Value;
use std::collections::HashMap;

use rtsync_types::ot::OtTypeId;

use crate::prelude::*;

/// A collection of realtime documents
#[derive(Debug, Clone, PartialEq)]
pub struct DocType {
	pub collection: String,
	pub ot_type: OtTypeId,
	/// Data paths indexed by the local store for equality lookups
	pub index_paths: Vec<String>,
}

impl DocType {
	pub fn new(collection: impl Into<String>, ot_type: OtTypeId) -> Self {
		Self { collection: collection.into(), ot_type, index_paths: Vec::new() }
	}

	pub fn with_index(mut self, path: impl Into<String>) -> Self {
		self.index_paths.push(path.into());
		self
	}
}

/// A kind of binary attachment referenced from documents.
///
/// Each document of `data_collection` holds at most one attachment of this
/// type; its url lives at `url_path` inside the document data and its
/// offline copy is stored under the document id.
#[derive(Debug, Clone, PartialEq)]
pub struct FileType {
	/// Local store collection holding cached and staged files
	pub name: String,
	pub data_collection: String,
	pub url_path: Vec<Value>,
}

impl FileType {
	pub fn new(name: impl Into<String>, data_collection: impl Into<String>, url_path: &[&str]) -> Self {
		Self {
			name: name.into(),
			data_collection: data_collection.into(),
			url_path: url_path.iter().map(|p| Value::from(*p)).collect(),
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
	doc_types: HashMap<String, DocType>,
	file_types: Vec<FileType>,
}

impl TypeRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_doc_type(mut self, doc_type: DocType) -> Self {
		self.doc_types.insert(doc_type.collection.clone(), doc_type);
		self
	}

	pub fn with_file_type(mut self, file_type: FileType) -> Self {
		self.file_types.retain(|ft| ft.name != file_type.name);
		self.file_types.push(file_type);
		self
	}

	pub fn doc_type(&self, collection: &str) -> RtResult<&DocType> {
		self.doc_types.get(collection).ok_or_else(|| Error::UnknownCollection(collection.to_string()))
	}

	pub fn doc_types(&self) -> impl Iterator<Item = &DocType> {
		self.doc_types.values()
	}

	pub fn file_types(&self) -> &[FileType] {
		&self.file_types
	}

	pub fn file_type(&self, name: &str) -> RtResult<&FileType> {
		self.file_types.iter().find(|ft| ft.name == name).ok_or_else(|| Error::UnknownCollection(name.to_string()))
	}
}


// vim: ts=4
