//! Input fabrication (spec section 4.4, "Input fabrication")
//!
//! At startup, either load input values from a user directory (one file per
//! input name; a text file for string tensors) or synthesize a zero/random
//! buffer sized to the input's shape times `batch_size`. Shape validation
//! against model metadata happens once here, not per request.

use multiserve_common::{Error, Result};
use multiserve_proto::{DataType, IoSpec, TensorBytes};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Where input tensor values come from.
pub enum InputSource {
    /// One file per input name under this directory.
    Directory(PathBuf),
    /// Fabricated zero or random buffers.
    Synthetic {
        zero: bool,
        string_length: usize,
        /// Fixed string payload; random printable strings if `None`.
        string_data: Option<String>,
    },
}

impl Default for InputSource {
    fn default() -> Self {
        InputSource::Synthetic {
            zero: false,
            string_length: 16,
            string_data: None,
        }
    }
}

fn dtype_byte_width(dtype: DataType) -> usize {
    match dtype {
        DataType::Bool | DataType::Int8 | DataType::Uint8 => 1,
        DataType::Int16 | DataType::Fp16 => 2,
        DataType::Int32 | DataType::Fp32 => 4,
        DataType::Int64 | DataType::Fp64 => 8,
        DataType::String => 0,
    }
}

/// Element count for one input at the given batch size, treating a
/// leading `-1` (variable) dimension as the batch dimension and any other
/// `-1` as a single element (a user-supplied `--shape` override should be
/// applied before fabrication if more precision is required).
fn element_count(dims: &[i64], batch_size: usize) -> usize {
    let mut count: usize = 1;
    for (i, &d) in dims.iter().enumerate() {
        let n = if d < 0 {
            if i == 0 {
                batch_size
            } else {
                1
            }
        } else {
            d as usize
        };
        count = count.saturating_mul(n);
    }
    if dims.is_empty() {
        count = batch_size;
    }
    count
}

fn synthesize_value(
    spec: &IoSpec,
    batch_size: usize,
    zero: bool,
    string_length: usize,
    string_data: &Option<String>,
) -> TensorBytes {
    let shape = if spec.dims.first() == Some(&-1) {
        let mut shape = spec.dims.clone();
        shape[0] = batch_size as i64;
        shape
    } else {
        spec.dims.clone()
    };

    if spec.data_type == DataType::String {
        let count = element_count(&spec.dims, batch_size);
        let mut bytes = Vec::new();
        for _ in 0..count {
            let s = match string_data {
                Some(fixed) => fixed.clone(),
                None => random_printable_string(string_length),
            };
            bytes.extend_from_slice(&(s.len() as u32).to_le_bytes());
            bytes.extend_from_slice(s.as_bytes());
        }
        return TensorBytes {
            dtype: DataType::String,
            shape,
            bytes,
        };
    }

    let byte_size = element_count(&spec.dims, batch_size) * dtype_byte_width(spec.data_type);
    let bytes = if zero {
        vec![0u8; byte_size]
    } else {
        let mut rng = rand::thread_rng();
        (0..byte_size).map(|_| rng.gen()).collect()
    };

    TensorBytes {
        dtype: spec.data_type,
        shape,
        bytes,
    }
}

fn random_printable_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn load_from_file(path: &Path, spec: &IoSpec) -> Result<TensorBytes> {
    if spec.data_type == DataType::String {
        let text = std::fs::read_to_string(path)?;
        let mut bytes = Vec::new();
        for line in text.lines() {
            bytes.extend_from_slice(&(line.len() as u32).to_le_bytes());
            bytes.extend_from_slice(line.as_bytes());
        }
        Ok(TensorBytes {
            dtype: DataType::String,
            shape: spec.dims.clone(),
            bytes,
        })
    } else {
        let bytes = std::fs::read(path)?;
        Ok(TensorBytes {
            dtype: spec.data_type,
            shape: spec.dims.clone(),
            bytes,
        })
    }
}

/// Builds one batch-1 set of input tensors for `inputs`, per `source`.
/// Directory files that are missing fall back to synthetic zero/random
/// fabrication for that one input, matching the original's per-input
/// resolution rather than failing the whole batch.
pub fn fabricate_inputs(
    inputs: &[IoSpec],
    batch_size: usize,
    source: &InputSource,
) -> Result<HashMap<String, TensorBytes>> {
    if batch_size == 0 {
        return Err(Error::invalid_argument("batch_size must be >= 1"));
    }

    let mut out = HashMap::new();
    for spec in inputs {
        let tensor = match source {
            InputSource::Directory(dir) => {
                let path = dir.join(&spec.name);
                if path.exists() {
                    load_from_file(&path, spec)?
                } else {
                    synthesize_value(spec, batch_size, false, 16, &None)
                }
            }
            InputSource::Synthetic {
                zero,
                string_length,
                string_data,
            } => synthesize_value(spec, batch_size, *zero, *string_length, string_data),
        };
        out.insert(spec.name.clone(), tensor);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, dtype: DataType, dims: Vec<i64>) -> IoSpec {
        IoSpec {
            name: name.into(),
            data_type: dtype,
            dims,
            reshape: None,
        }
    }

    #[test]
    fn zero_synthesis_produces_correctly_sized_zero_buffer() {
        let specs = vec![spec("x", DataType::Fp32, vec![-1, 4])];
        let source = InputSource::Synthetic {
            zero: true,
            string_length: 8,
            string_data: None,
        };
        let out = fabricate_inputs(&specs, 2, &source).unwrap();
        let tensor = &out["x"];
        assert_eq!(tensor.bytes.len(), 2 * 4 * 4);
        assert!(tensor.bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn string_synthesis_encodes_length_prefixed_strings() {
        let specs = vec![spec("s", DataType::String, vec![-1])];
        let source = InputSource::Synthetic {
            zero: false,
            string_length: 5,
            string_data: Some("hello".into()),
        };
        let out = fabricate_inputs(&specs, 3, &source).unwrap();
        let tensor = &out["s"];
        // 3 strings, each 4-byte length prefix + 5 bytes.
        assert_eq!(tensor.bytes.len(), 3 * (4 + 5));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let specs = vec![spec("x", DataType::Fp32, vec![-1])];
        let source = InputSource::default();
        assert!(fabricate_inputs(&specs, 0, &source).is_err());
    }

    #[test]
    fn missing_directory_file_falls_back_to_synthesis() {
        let dir = tempfile::tempdir().unwrap();
        let specs = vec![spec("missing", DataType::Fp32, vec![-1, 2])];
        let source = InputSource::Directory(dir.path().to_path_buf());
        let out = fabricate_inputs(&specs, 1, &source).unwrap();
        assert_eq!(out["missing"].bytes.len(), 2 * 4);
    }
}
