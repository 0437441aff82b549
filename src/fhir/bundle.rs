//! FHIR search result bundles.

use serde::Deserialize;
use serde_json::Value;

/// The parts of a `searchset` Bundle the client reads.
#[derive(Debug, Default, Deserialize)]
pub struct Bundle {
    #[serde(default)]
    pub entry: Vec<BundleEntry>,

    #[serde(default)]
    pub link: Vec<BundleLink>,
}

#[derive(Debug, Deserialize)]
pub struct BundleEntry {
    #[serde(default)]
    pub resource: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct BundleLink {
    pub relation: String,
    pub url: String,
}

impl Bundle {
    /// Returns the URL of the next page, if the server paginated the result.
    pub fn next_link(&self) -> Option<&str> {
        self.link
            .iter()
            .find(|l| l.relation == "next")
            .map(|l| l.url.as_str())
    }

    /// Consumes the bundle, yielding the embedded resources.
    pub fn into_resources(self) -> impl Iterator<Item = Value> {
        self.entry.into_iter().filter_map(|e| e.resource)
    }
}
