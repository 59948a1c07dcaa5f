//! Example library hosted by the worker executable.
//!
//! Mirrors the numeric and string routines of the reference Fortran example
//! library, so sessions can be exercised end to end without a foreign binary.

use std::path::{Path, PathBuf};

use bitbridge::adapter::{Args, Catalog, HostedLibrary, LoadError, NativeError};
use bitbridge::protocol::codec::DEFAULT_MAX_FRAME_LENGTH;
use bitbridge::protocol::{Matrix, ScalarKind, TypeTag, Value};

const DIMENSION_MISMATCH: &str = "DimensionMismatch";

/// Largest product matrix whose response still fits in one frame.
const MAX_PRODUCT_ELEMENTS: usize = DEFAULT_MAX_FRAME_LENGTH / size_of::<f64>();

const ARRAY_F64: TypeTag = TypeTag::Array(ScalarKind::F64);
const MATRIX_F64: TypeTag = TypeTag::Matrix(ScalarKind::F64);

pub struct ExampleLibrary {
    path: PathBuf,
}

impl HostedLibrary for ExampleLibrary {
    fn load(path: &Path) -> Result<Self, LoadError> {
        let metadata = std::fs::metadata(path).map_err(|e| LoadError::new(path, e.to_string()))?;
        if !metadata.is_file() {
            return Err(LoadError::new(path, "not a regular file"));
        }
        let path = std::path::absolute(path).map_err(|e| LoadError::new(path, e.to_string()))?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn catalog() -> Catalog<Self> {
        Catalog::new()
            .register(
                "sum_8bit",
                &[("a", TypeTag::I8), ("b", TypeTag::I8)],
                TypeTag::I8,
                |_, args| Ok(Value::I8(args.get::<i8>(0)?.wrapping_add(args.get(1)?))),
            )
            .register(
                "sum_16bit",
                &[("a", TypeTag::I16), ("b", TypeTag::I16)],
                TypeTag::I16,
                |_, args| Ok(Value::I16(args.get::<i16>(0)?.wrapping_add(args.get(1)?))),
            )
            .register(
                "sum_32bit",
                &[("a", TypeTag::I32), ("b", TypeTag::I32)],
                TypeTag::I32,
                |_, args| Ok(Value::I32(args.get::<i32>(0)?.wrapping_add(args.get(1)?))),
            )
            .register(
                "sum_64bit",
                &[("a", TypeTag::I64), ("b", TypeTag::I64)],
                TypeTag::I64,
                |_, args| Ok(Value::I64(args.get::<i64>(0)?.wrapping_add(args.get(1)?))),
            )
            .register(
                "multiply_float32",
                &[("a", TypeTag::F32), ("b", TypeTag::F32)],
                TypeTag::F32,
                |_, args| Ok(Value::F32(args.get::<f32>(0)? * args.get::<f32>(1)?)),
            )
            .register(
                "multiply_float64",
                &[("a", TypeTag::F64), ("b", TypeTag::F64)],
                TypeTag::F64,
                |_, args| Ok(Value::F64(args.get::<f64>(0)? * args.get::<f64>(1)?)),
            )
            .register(
                "is_positive",
                &[("a", TypeTag::F64)],
                TypeTag::Bool,
                |_, args| Ok(Value::Bool(args.get::<f64>(0)? > 0.0)),
            )
            .register(
                "add_or_subtract",
                &[
                    ("a", TypeTag::I32),
                    ("b", TypeTag::I32),
                    ("do_addition", TypeTag::Bool),
                ],
                TypeTag::I32,
                add_or_subtract,
            )
            .register("factorial", &[("n", TypeTag::I8)], TypeTag::F64, factorial)
            .register(
                "standard_deviation",
                &[("data", ARRAY_F64)],
                TypeTag::F64,
                standard_deviation,
            )
            .register(
                "reverse_string",
                &[("original", TypeTag::Text)],
                TypeTag::Text,
                |_, args| {
                    let original: String = args.get(0)?;
                    Ok(Value::Text(original.chars().rev().collect()))
                },
            )
            .register(
                "add_1d_arrays",
                &[("a1", ARRAY_F64), ("a2", ARRAY_F64)],
                ARRAY_F64,
                add_1d_arrays,
            )
            .register(
                "matrix_multiply",
                &[("a1", MATRIX_F64), ("a2", MATRIX_F64)],
                MATRIX_F64,
                matrix_multiply,
            )
    }
}

fn add_or_subtract(_: &mut ExampleLibrary, args: &Args) -> Result<Value, NativeError> {
    let a: i32 = args.get(0)?;
    let b: i32 = args.get(1)?;
    let result = if args.get(2)? {
        a.wrapping_add(b)
    } else {
        a.wrapping_sub(b)
    };
    Ok(Value::I32(result))
}

fn factorial(_: &mut ExampleLibrary, args: &Args) -> Result<Value, NativeError> {
    let n: i8 = args.get(0)?;
    if n < 0 {
        return Err(NativeError::invalid_argument(format!(
            "n must be in 0..=127, got {n}"
        )));
    }
    Ok(Value::F64((1..=n).map(f64::from).product()))
}

/// Sample standard deviation (n - 1 in the denominator).
fn standard_deviation(_: &mut ExampleLibrary, args: &Args) -> Result<Value, NativeError> {
    let data: Vec<f64> = args.get(0)?;
    if data.len() < 2 {
        return Err(NativeError::invalid_argument(format!(
            "need at least 2 values, got {}",
            data.len()
        )));
    }
    let n = data.len() as f64;
    let mean = data.iter().sum::<f64>() / n;
    let variance = data.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Ok(Value::F64(variance.sqrt()))
}

fn add_1d_arrays(_: &mut ExampleLibrary, args: &Args) -> Result<Value, NativeError> {
    let a1: Vec<f64> = args.get(0)?;
    let a2: Vec<f64> = args.get(1)?;
    if a1.len() != a2.len() {
        return Err(NativeError::new(
            DIMENSION_MISMATCH,
            format!("arrays have lengths {} and {}", a1.len(), a2.len()),
        ));
    }
    let sum: Vec<f64> = a1.iter().zip(&a2).map(|(x, y)| x + y).collect();
    Ok(Value::from(sum))
}

fn matrix_multiply(_: &mut ExampleLibrary, args: &Args) -> Result<Value, NativeError> {
    let a1: Matrix = args.get(0)?;
    let a2: Matrix = args.get(1)?;
    if a1.cols() != a2.rows() {
        return Err(NativeError::new(
            DIMENSION_MISMATCH,
            format!(
                "cannot multiply {}x{} by {}x{}",
                a1.rows(),
                a1.cols(),
                a2.rows(),
                a2.cols()
            ),
        ));
    }
    let (Some(lhs), Some(rhs)) = (a1.values::<f64>(), a2.values::<f64>()) else {
        return Err(NativeError::invalid_argument("matrices must hold f64 values"));
    };

    let (rows, inner, cols) = (a1.rows(), a1.cols(), a2.cols());
    let len = rows
        .checked_mul(cols)
        .filter(|&len| len <= MAX_PRODUCT_ELEMENTS)
        .ok_or_else(|| {
            NativeError::new(
                DIMENSION_MISMATCH,
                format!("a {rows}x{cols} product exceeds {MAX_PRODUCT_ELEMENTS} elements"),
            )
        })?;
    let mut product = vec![0.0; len];
    for i in 0..rows {
        for j in 0..cols {
            product[i * cols + j] = (0..inner).map(|k| lhs[i * inner + k] * rhs[k * cols + j]).sum();
        }
    }
    Ok(Value::Matrix(Matrix::new(rows, cols, product)?))
}
