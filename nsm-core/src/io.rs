//! ASCII matrix files for simulation traces and reference data.
//!
//! One row per line, values separated by spaces and written with 17
//! significant digits. With dimensions the first line is `rows cols`.
//!
//! ```text
//! 2 3
//! 0.00000000000000000e0 1.00000000000000000e0 2.50000000000000000e-1
//! 1.00000000000000006e-1 9.99999999999999978e-1 2.50000000000000000e-1
//! ```

use crate::error::{Error, Result};
use crate::types::Matrix;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Write `matrix` to `writer`, with the `rows cols` header when `with_dims`.
pub fn write_matrix<W: Write>(writer: &mut W, matrix: &Matrix, with_dims: bool) -> Result<()> {
    if with_dims {
        writeln!(writer, "{} {}", matrix.nrows(), matrix.ncols())?;
    }
    for row in matrix.row_iter() {
        let line: Vec<String> = row.iter().map(|v| format!("{:.17e}", v)).collect();
        writeln!(writer, "{}", line.join(" "))?;
    }
    Ok(())
}

pub fn write_ascii(path: impl AsRef<Path>, matrix: &Matrix, with_dims: bool) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path.as_ref())?);
    write_matrix(&mut writer, matrix, with_dims)?;
    writer.flush()?;
    Ok(())
}

/// Read a matrix written with or without its header.
///
/// A first line of two integers is taken as the header when the rest of the
/// data has that shape.
pub fn read_matrix<R: BufRead>(reader: R) -> Result<Matrix> {
    let mut rows: Vec<Vec<f64>> = Vec::new();
    let mut raw_first: Option<Vec<String>> = None;
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }
        if raw_first.is_none() {
            raw_first = Some(tokens.iter().map(|t| t.to_string()).collect());
        }
        let values = tokens
            .iter()
            .map(|t| {
                t.parse::<f64>()
                    .map_err(|_| Error::Parse(format!("line {}: '{}' is not a number", number + 1, t)))
            })
            .collect::<Result<Vec<f64>>>()?;
        rows.push(values);
    }

    let header = raw_first.as_ref().and_then(|tokens| match tokens.as_slice() {
        [r, c] => Some((r.parse::<usize>().ok()?, c.parse::<usize>().ok()?)),
        _ => None,
    });
    if let Some((nrows, ncols)) = header {
        let body = &rows[1..];
        if body.len() == nrows && body.iter().all(|row| row.len() == ncols) {
            return Ok(from_rows(body, nrows, ncols));
        }
    }

    let ncols = rows.first().map_or(0, Vec::len);
    if let Some((i, row)) = rows.iter().enumerate().find(|(_, row)| row.len() != ncols) {
        return Err(Error::Parse(format!("row {} has {} values, expected {}", i, row.len(), ncols)));
    }
    Ok(from_rows(&rows, rows.len(), ncols))
}

pub fn read_ascii(path: impl AsRef<Path>) -> Result<Matrix> {
    read_matrix(BufReader::new(File::open(path.as_ref())?))
}

fn from_rows(rows: &[Vec<f64>], nrows: usize, ncols: usize) -> Matrix {
    Matrix::from_fn(nrows, ncols, |i, j| rows[i][j])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_header_line() {
        let m = Matrix::from_row_slice(2, 3, &[0.0, 1.0, 0.25, 0.1, 1.0 - 1e-16, -3.5]);
        let mut buffer = Vec::new();
        write_matrix(&mut buffer, &m, true).unwrap();
        let text = String::from_utf8(buffer.clone()).unwrap();
        assert_eq!(text.lines().next(), Some("2 3"));
        assert_eq!(text.lines().count(), 3);
        let back = read_matrix(Cursor::new(buffer)).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn test_without_dims() {
        let m = Matrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let mut buffer = Vec::new();
        write_matrix(&mut buffer, &m, false).unwrap();
        let back = read_matrix(Cursor::new(buffer)).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn test_integer_pair_without_header() {
        // "1 2" is a header only if the rest matches it
        let back = read_matrix(Cursor::new("1 2\n3 4\n5 6\n")).unwrap();
        assert_eq!(back.shape(), (3, 2));
        assert_eq!(back[(0, 1)], 2.0);
    }

    #[test]
    fn test_ragged_rows_are_rejected() {
        assert!(matches!(read_matrix(Cursor::new("1 2 3\n4 5\n")), Err(Error::Parse(_))));
        assert!(matches!(read_matrix(Cursor::new("1 x\n")), Err(Error::Parse(_))));
    }
}
