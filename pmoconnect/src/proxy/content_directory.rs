use std::fmt;

use super::{ServiceProxy, required, required_number, split_list};
use crate::errors::ProxyError;

/// Mode de `Browse`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowseFlag {
    Metadata,
    DirectChildren,
}

impl BrowseFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            BrowseFlag::Metadata => "BrowseMetadata",
            BrowseFlag::DirectChildren => "BrowseDirectChildren",
        }
    }
}

impl fmt::Display for BrowseFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Résultat de `Browse` ; `result` est le document DIDL-Lite brut.
#[derive(Debug, Clone, PartialEq)]
pub struct BrowseResult {
    pub result: String,
    pub number_returned: u32,
    pub total_matches: u32,
    pub update_id: u32,
}

/// Proxy du service ContentDirectory
#[derive(Debug, Clone)]
pub struct ContentDirectoryProxy {
    service: ServiceProxy,
}

impl ContentDirectoryProxy {
    pub fn new(service: ServiceProxy) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &ServiceProxy {
        &self.service
    }

    pub fn get_search_capabilities(&self) -> Result<Vec<String>, ProxyError> {
        let response = self.service.invoke("GetSearchCapabilities", &[])?;
        Ok(split_list(response.get("SearchCaps").unwrap_or_default()))
    }

    pub fn get_sort_capabilities(&self) -> Result<Vec<String>, ProxyError> {
        let response = self.service.invoke("GetSortCapabilities", &[])?;
        Ok(split_list(response.get("SortCaps").unwrap_or_default()))
    }

    pub fn get_system_update_id(&self) -> Result<u32, ProxyError> {
        let response = self.service.invoke("GetSystemUpdateID", &[])?;
        required_number(&response, "Id")
    }

    pub fn browse(
        &self,
        object_id: &str,
        flag: BrowseFlag,
        filter: &str,
        starting_index: u32,
        requested_count: u32,
        sort_criteria: &str,
    ) -> Result<BrowseResult, ProxyError> {
        let starting_index = starting_index.to_string();
        let requested_count = requested_count.to_string();
        let response = self.service.invoke(
            "Browse",
            &[
                ("ObjectID", object_id),
                ("BrowseFlag", flag.as_str()),
                ("Filter", filter),
                ("StartingIndex", &starting_index),
                ("RequestedCount", &requested_count),
                ("SortCriteria", sort_criteria),
            ],
        )?;

        Ok(BrowseResult {
            result: required(&response, "Result")?.to_string(),
            number_returned: required_number(&response, "NumberReturned")?,
            total_matches: required_number(&response, "TotalMatches")?,
            update_id: required_number(&response, "UpdateID")?,
        })
    }

    /// Enfants directs de `object_id`, tous champs, sans tri.
    pub fn browse_children(
        &self,
        object_id: &str,
        starting_index: u32,
        requested_count: u32,
    ) -> Result<BrowseResult, ProxyError> {
        self.browse(
            object_id,
            BrowseFlag::DirectChildren,
            "*",
            starting_index,
            requested_count,
            "",
        )
    }
}
