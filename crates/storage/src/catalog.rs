//! `PoolFileCatalog_HPC.xml` / `PoolFileCatalog_Temp.xml` — GUID→path
//! catalogs the payload reads to resolve input files (spec.md §6).

use crate::error::StorageError;
use quick_xml::de::from_str;
use quick_xml::se::to_string;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "File")]
pub struct CatalogEntry {
    #[serde(rename = "@ID")]
    pub guid: String,
    #[serde(rename = "pfn")]
    pub pfn: Pfn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pfn {
    #[serde(rename = "@name")]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename = "POOLFILECATALOG")]
pub struct PoolFileCatalog {
    #[serde(rename = "File", default)]
    pub files: Vec<CatalogEntry>,
}

impl PoolFileCatalog {
    pub fn insert(&mut self, guid: impl Into<String>, path: impl Into<String>) {
        self.files.push(CatalogEntry { guid: guid.into(), pfn: Pfn { name: path.into() } });
    }

    pub fn path_for(&self, guid: &str) -> Option<&str> {
        self.files.iter().find(|f| f.guid == guid).map(|f| f.pfn.name.as_str())
    }
}

pub fn write_catalog(path: &Path, catalog: &PoolFileCatalog) -> Result<(), StorageError> {
    let xml = to_string(catalog)
        .map_err(|e| StorageError::format("PoolFileCatalog", path.display().to_string(), e.to_string()))?;
    let body = format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{xml}\n");
    std::fs::write(path, body).map_err(|e| StorageError::io(path.display().to_string(), e))
}

pub fn read_catalog(path: &Path) -> Result<PoolFileCatalog, StorageError> {
    let raw = std::fs::read_to_string(path).map_err(|e| StorageError::io(path.display().to_string(), e))?;
    from_str(&raw)
        .map_err(|e| StorageError::format("PoolFileCatalog", path.display().to_string(), e.to_string()))
}
