//! Declared inputs, as read from a project declaration.

use serde::{Deserialize, Serialize};

use crate::{DataDisposition, DatasetOrientation};

/// One declared source: a file, a directory or a web service URI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclaredSource {
    /// File path, directory or `http(s)` URI
    pub uri: String,

    /// Glob pattern applied to files beneath a directory
    #[serde(default)]
    pub pattern: Option<String>,

    /// Sentinel values that mean "missing" in this source
    #[serde(default)]
    pub missing_values: Vec<f64>,

    /// Variable to read, when the source carries several
    #[serde(default)]
    pub variable: Option<String>,

    /// Format hint, required for web sources
    #[serde(default)]
    pub disposition: Option<DataDisposition>,
}

impl DeclaredSource {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            pattern: None,
            missing_values: Vec::new(),
            variable: None,
            disposition: None,
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn with_missing_values(mut self, missing_values: Vec<f64>) -> Self {
        self.missing_values = missing_values;
        self
    }

    pub fn with_variable(mut self, variable: impl Into<String>) -> Self {
        self.variable = Some(variable.into());
        self
    }

    pub fn with_disposition(mut self, disposition: DataDisposition) -> Self {
        self.disposition = Some(disposition);
        self
    }
}

/// Every declared source, grouped by orientation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Declaration {
    #[serde(default)]
    pub left: Vec<DeclaredSource>,
    #[serde(default)]
    pub right: Vec<DeclaredSource>,
    #[serde(default)]
    pub baseline: Vec<DeclaredSource>,
    #[serde(default)]
    pub covariates: Vec<DeclaredSource>,
}

impl Declaration {
    pub fn sources(&self, orientation: DatasetOrientation) -> &[DeclaredSource] {
        match orientation {
            DatasetOrientation::Left => &self.left,
            DatasetOrientation::Right => &self.right,
            DatasetOrientation::Baseline => &self.baseline,
            DatasetOrientation::Covariate => &self.covariates,
        }
    }

    /// All declared sources in declaration order: left, right, baseline,
    /// then covariates.
    pub fn iter(&self) -> impl Iterator<Item = (DatasetOrientation, &DeclaredSource)> {
        DatasetOrientation::ALL
            .into_iter()
            .flat_map(move |o| self.sources(o).iter().map(move |s| (o, s)))
    }
}
