//! Output descriptors: shape, dtype and search-beam annotation of a layer.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One axis of a layer output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dim {
    /// The batch axis (batch entries times beam hypotheses at run time).
    Batch,
    /// A dynamic axis whose size is only known at run time.
    Dynamic,
    Static(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Float32,
    Int32,
    Bool,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::Float32 => write!(f, "float32"),
            DType::Int32 => write!(f, "int32"),
            DType::Bool => write!(f, "bool"),
        }
    }
}

/// The search beam a value lives in: the choice layer that owns it and
/// the number of hypotheses it keeps.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchBeam {
    pub choice: String,
    pub size: usize,
}

/// Shape/dtype descriptor of one step's output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputDesc {
    pub shape: Vec<Dim>,
    pub dtype: DType,
    /// Output is an index into a vocabulary rather than dense features.
    pub sparse: bool,
    /// Feature width for dense outputs, vocabulary size for sparse ones.
    pub dim: Option<usize>,
    pub beam: Option<SearchBeam>,
}

impl OutputDesc {
    pub fn dense(n_out: usize) -> Self {
        Self {
            shape: vec![Dim::Batch, Dim::Static(n_out)],
            dtype: DType::Float32,
            sparse: false,
            dim: Some(n_out),
            beam: None,
        }
    }

    pub fn sparse(vocab: usize) -> Self {
        Self {
            shape: vec![Dim::Batch],
            dtype: DType::Int32,
            sparse: true,
            dim: Some(vocab),
            beam: None,
        }
    }

    /// Boolean flag per hypothesis, e.g. the `end` layer.
    pub fn flag() -> Self {
        Self {
            shape: vec![Dim::Batch],
            dtype: DType::Bool,
            sparse: true,
            dim: Some(2),
            beam: None,
        }
    }

    pub fn with_beam(mut self, beam: Option<SearchBeam>) -> Self {
        self.beam = beam;
        self
    }

    /// Feature width of a dense output, or 1 for sparse outputs.
    pub fn width(&self) -> usize {
        if self.sparse {
            1
        } else {
            self.dim.unwrap_or(1)
        }
    }

    pub fn beam_size(&self) -> usize {
        self.beam.as_ref().map_or(1, |b| b.size)
    }
}

impl fmt::Display for OutputDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self
            .shape
            .iter()
            .map(|d| match d {
                Dim::Batch => "B".to_string(),
                Dim::Dynamic => "?".to_string(),
                Dim::Static(n) => n.to_string(),
            })
            .collect();
        write!(f, "[{}] {}", dims.join(","), self.dtype)?;
        if self.sparse {
            write!(f, " sparse(dim={})", self.dim.unwrap_or(0))?;
        }
        if let Some(beam) = &self.beam {
            write!(f, " beam({}, {})", beam.choice, beam.size)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_dense_with_beam() {
        let desc = OutputDesc::dense(7).with_beam(Some(SearchBeam {
            choice: "output".into(),
            size: 3,
        }));
        assert_eq!(desc.to_string(), "[B,7] float32 beam(output, 3)");
        assert_eq!(desc.beam_size(), 3);
        assert_eq!(desc.width(), 7);
    }

    #[test]
    fn sparse_width_is_one() {
        let desc = OutputDesc::sparse(10);
        assert_eq!(desc.width(), 1);
        assert_eq!(desc.to_string(), "[B] int32 sparse(dim=10)");
    }
}
