//! Sorting stations: which tool picks an object and which bin it goes to.
//!
//! | Choice | Rule |
//! |---|---|
//! | tool | first tool whose `handles` lists the classification, else `default_tool` |
//! | bin | first bin accepting the classification *and* size class, else the first accepting the classification at any size, else `default_bin` |
//!
//! `"all"` in a bin's `accepts` or `size_range` matches anything.  With no
//! tools configured every object is picked with whatever is mounted.

use cncsort_types::{DetectedObject, MachinePosition};
use serde::{Deserialize, Serialize};

/// Wildcard accepted in [`BinConfig::accepts`] and [`BinConfig::size_range`].
pub const ANY: &str = "all";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    pub id: String,
    /// Classifications this tool can pick.
    #[serde(default)]
    pub handles: Vec<String>,
    /// Where the head goes to swap to this tool.  `None` means the tool is
    /// switched in place (e.g. a second nozzle).
    #[serde(default)]
    pub change_location: Option<MachinePosition>,
}

impl ToolConfig {
    pub fn handles(&self, classification: &str) -> bool {
        self.handles.iter().any(|h| h == classification)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinConfig {
    pub id: String,
    /// Drop-off point; the place move descends onto it.
    pub location: MachinePosition,
    #[serde(default)]
    pub accepts: Vec<String>,
    #[serde(default = "any_size")]
    pub size_range: Vec<String>,
}

fn any_size() -> Vec<String> {
    vec![ANY.to_string()]
}

impl BinConfig {
    pub fn accepts_kind(&self, classification: &str) -> bool {
        self.accepts.iter().any(|a| a == classification || a == ANY)
    }

    pub fn accepts_size(&self, size: &str) -> bool {
        self.size_range.iter().any(|s| s == size || s == ANY)
    }
}

/// Outcome of [`SortingConfig::select_tool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolChoice {
    /// No tools configured: pick with whatever is mounted.
    Mounted,
    /// Index into [`SortingConfig::tools`].
    Tool(usize),
    /// Tools are configured but none handles the object and there is no
    /// default.
    NoneFits,
}

/// The `[sorting]` configuration section.  Sorting is off while `bins` is
/// empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SortingConfig {
    pub tools: Vec<ToolConfig>,
    pub bins: Vec<BinConfig>,
    pub default_tool: Option<String>,
    pub default_bin: Option<String>,
}

impl SortingConfig {
    pub fn is_enabled(&self) -> bool {
        !self.bins.is_empty()
    }

    pub fn tool(&self, id: &str) -> Option<&ToolConfig> {
        self.tools.iter().find(|t| t.id == id)
    }

    pub fn bin(&self, id: &str) -> Option<&BinConfig> {
        self.bins.iter().find(|b| b.id == id)
    }

    pub fn select_tool(&self, obj: &DetectedObject) -> ToolChoice {
        if self.tools.is_empty() {
            return ToolChoice::Mounted;
        }
        self.tools
            .iter()
            .position(|t| t.handles(&obj.classification))
            .or_else(|| {
                let id = self.default_tool.as_deref()?;
                self.tools.iter().position(|t| t.id == id)
            })
            .map_or(ToolChoice::NoneFits, ToolChoice::Tool)
    }

    pub fn select_bin(&self, obj: &DetectedObject) -> Option<&BinConfig> {
        let kind = obj.classification.as_str();
        let size = obj.size_class.as_str();
        self.bins
            .iter()
            .find(|b| b.accepts_kind(kind) && b.accepts_size(size))
            .or_else(|| self.bins.iter().find(|b| b.accepts.iter().any(|a| a == kind)))
            .or_else(|| self.default_bin.as_deref().and_then(|id| self.bin(id)))
    }

    /// Dangling `default_*` ids and duplicate station ids.
    pub fn check_references(&self) -> Result<(), String> {
        if let Some(id) = &self.default_tool
            && self.tool(id).is_none()
        {
            return Err(format!("default tool '{id}' is not configured"));
        }
        if let Some(id) = &self.default_bin
            && self.bin(id).is_none()
        {
            return Err(format!("default bin '{id}' is not configured"));
        }
        for (i, t) in self.tools.iter().enumerate() {
            if self.tools[..i].iter().any(|o| o.id == t.id) {
                return Err(format!("tool '{}' is configured twice", t.id));
            }
        }
        for (i, b) in self.bins.iter().enumerate() {
            if self.bins[..i].iter().any(|o| o.id == b.id) {
                return Err(format!("bin '{}' is configured twice", b.id));
            }
        }
        Ok(())
    }
}
