//! Dense embedding matrix shared across training workers.
//!
//! Rows are updated concurrently by all workers without locks; the SGD
//! noise tolerance of the training objective absorbs lost updates. Every
//! cell is an `f32` stored in an `AtomicU32` accessed with relaxed
//! ordering, which keeps the matrix `Sync` without taking locks on the
//! hot path.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU32, Ordering};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ndarray::Array1;

use crate::error::{Error, Result};
use crate::rng::MinstdRand;

/// A single matrix cell: f32 bits behind a relaxed atomic.
#[derive(Default)]
#[repr(transparent)]
struct Cell {
    bits: AtomicU32,
}

impl Cell {
    #[inline]
    fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }

    #[inline]
    fn set(&self, value: f32) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    #[inline]
    fn add(&self, x: f32) {
        self.set(self.get() + x);
    }
}

/// Row-major `rows × cols` matrix of `f32`.
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<Cell>,
}

impl Matrix {
    /// Zero-filled matrix.
    pub fn new(rows: usize, cols: usize) -> Self {
        let mut data = Vec::with_capacity(rows * cols);
        data.resize_with(rows * cols, Cell::default);
        Matrix { rows, cols, data }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }

    #[inline]
    fn cell(&self, i: usize, j: usize) -> &Cell {
        &self.data[i * self.cols + j]
    }

    pub fn at(&self, i: usize, j: usize) -> f32 {
        self.cell(i, j).get()
    }

    pub fn set(&self, i: usize, j: usize, value: f32) {
        self.cell(i, j).set(value);
    }

    /// Fill with samples from `U(-bound, bound)` in strict row-major
    /// order so that a fixed seed reproduces the reference layout.
    pub fn uniform(&self, rng: &mut MinstdRand, bound: f32) {
        for cell in &self.data {
            cell.set(rng.uniform(-bound, bound));
        }
    }

    /// Copy a row into an owned vector.
    pub fn row(&self, i: usize) -> Vec<f32> {
        debug_assert!(i < self.rows);
        let base = i * self.cols;
        (0..self.cols).map(|j| self.data[base + j].get()).collect()
    }

    /// `⟨row_i, vec⟩`. Raises on NaN: a NaN here means the matrix has
    /// been corrupted and must not silently propagate.
    pub fn dot_row(&self, vec: &[f32], i: usize) -> Result<f32> {
        debug_assert!(i < self.rows);
        debug_assert_eq!(vec.len(), self.cols);
        let base = i * self.cols;
        let mut d = 0.0;
        for (j, &v) in vec.iter().enumerate() {
            d += self.data[base + j].get() * v;
        }
        if d.is_nan() {
            return Err(Error::Nan);
        }
        Ok(d)
    }

    /// `row_i += a · vec`.
    pub fn add_row(&self, vec: &[f32], i: usize, a: f32) {
        debug_assert!(i < self.rows);
        debug_assert_eq!(vec.len(), self.cols);
        let base = i * self.cols;
        for (j, &v) in vec.iter().enumerate() {
            self.data[base + j].add(a * v);
        }
    }

    /// `dst += a · row_i`.
    pub fn add_row_to(&self, dst: &mut [f32], i: usize, a: f32) {
        debug_assert!(i < self.rows);
        debug_assert_eq!(dst.len(), self.cols);
        let base = i * self.cols;
        for (j, d) in dst.iter_mut().enumerate() {
            *d += a * self.data[base + j].get();
        }
    }

    /// Scale each row `i` in `[ib, ie)` by `nums[i - ib]`; zero scalars
    /// leave the row untouched.
    pub fn multiply_row(&self, nums: &[f32], ib: usize, ie: usize) {
        self.row_op(nums, ib, ie, |value, scalar| value * scalar)
    }

    /// Divide each row `i` in `[ib, ie)` by `denoms[i - ib]`; zero
    /// denominators leave the row untouched.
    pub fn divide_row(&self, denoms: &[f32], ib: usize, ie: usize) {
        self.row_op(denoms, ib, ie, |value, scalar| value / scalar)
    }

    fn row_op(&self, scalars: &[f32], ib: usize, ie: usize, op: impl Fn(f32, f32) -> f32) {
        debug_assert!(ie <= self.rows);
        debug_assert!(ie - ib <= scalars.len());
        for i in ib..ie {
            let scalar = scalars[i - ib];
            if scalar == 0.0 {
                continue;
            }
            let base = i * self.cols;
            for j in 0..self.cols {
                let cell = &self.data[base + j];
                cell.set(op(cell.get(), scalar));
            }
        }
    }

    /// Per-row L2 norms. Raises on NaN like [`Matrix::dot_row`].
    pub fn l2_norm_row(&self) -> Result<Array1<f32>> {
        let mut norms = Vec::with_capacity(self.rows);
        for i in 0..self.rows {
            let base = i * self.cols;
            let mut norm = 0.0f32;
            for j in 0..self.cols {
                let v = self.data[base + j].get();
                norm += v * v;
            }
            if norm.is_nan() {
                return Err(Error::Nan);
            }
            norms.push(norm.sqrt());
        }
        Ok(Array1::from(norms))
    }

    /// Deep copy.
    pub fn copy(&self) -> Matrix {
        let res = Matrix::new(self.rows, self.cols);
        for (dst, src) in res.data.iter().zip(&self.data) {
            dst.set(src.get());
        }
        res
    }

    /// Flatten into a row-major `Vec<f32>`.
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.iter().map(Cell::get).collect()
    }

    pub fn write(&self, write: &mut impl Write) -> Result<()> {
        write
            .write_i64::<LittleEndian>(self.rows as i64)
            .map_err(|e| Error::write_error("Cannot write number of matrix rows", e))?;
        write
            .write_i64::<LittleEndian>(self.cols as i64)
            .map_err(|e| Error::write_error("Cannot write number of matrix columns", e))?;
        for cell in &self.data {
            write
                .write_f32::<LittleEndian>(cell.get())
                .map_err(|e| Error::write_error("Cannot write matrix component", e))?;
        }
        Ok(())
    }

    pub fn read(read: &mut impl Read) -> Result<Matrix> {
        let rows = read
            .read_i64::<LittleEndian>()
            .map_err(|e| Error::read_error("Cannot read number of matrix rows", e))?;
        let cols = read
            .read_i64::<LittleEndian>()
            .map_err(|e| Error::read_error("Cannot read number of matrix columns", e))?;
        if rows < 0 || cols < 0 {
            return Err(Error::format_error(format!(
                "Negative matrix shape: {} x {}",
                rows, cols
            )));
        }

        let mut data = vec![0f32; rows as usize * cols as usize];
        read.read_f32_into::<LittleEndian>(&mut data)
            .map_err(|e| Error::read_error("Cannot read matrix data", e))?;

        let matrix = Matrix::new(rows as usize, cols as usize);
        for (cell, value) in matrix.data.iter().zip(data) {
            cell.set(value);
        }
        Ok(matrix)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use approx::assert_abs_diff_eq;

    use super::Matrix;
    use crate::rng::MinstdRand;

    #[test]
    fn dot_and_add_row() {
        let m = Matrix::new(2, 3);
        m.add_row(&[1.0, 2.0, 3.0], 1, 2.0);
        assert_abs_diff_eq!(m.at(1, 0), 2.0);
        assert_abs_diff_eq!(m.at(1, 2), 6.0);
        let d = m.dot_row(&[1.0, 1.0, 1.0], 1).unwrap();
        assert_abs_diff_eq!(d, 12.0);
        // Row 0 was never touched.
        assert_abs_diff_eq!(m.dot_row(&[1.0, 1.0, 1.0], 0).unwrap(), 0.0);
    }

    #[test]
    fn nan_is_raised_not_propagated() {
        let m = Matrix::new(1, 2);
        m.set(0, 0, f32::NAN);
        assert!(m.dot_row(&[1.0, 1.0], 0).is_err());
        assert!(m.l2_norm_row().is_err());
    }

    #[test]
    fn uniform_is_deterministic_and_row_major() {
        let a = Matrix::new(3, 4);
        let b = Matrix::new(3, 4);
        a.uniform(&mut MinstdRand::new(1), 0.1);
        b.uniform(&mut MinstdRand::new(1), 0.1);
        assert_eq!(a.to_vec(), b.to_vec());
        assert!(a.to_vec().iter().all(|v| (-0.1..0.1).contains(v)));

        // A single long fill equals the row-major matrix fill.
        let mut rng = MinstdRand::new(1);
        let flat: Vec<f32> = (0..12).map(|_| rng.uniform(-0.1, 0.1)).collect();
        assert_eq!(a.to_vec(), flat);
    }

    #[test]
    fn norms_and_row_scaling() {
        let m = Matrix::new(2, 2);
        m.set(0, 0, 3.0);
        m.set(0, 1, 4.0);
        m.set(1, 0, 1.0);
        let norms = m.l2_norm_row().unwrap();
        assert_abs_diff_eq!(norms[0], 5.0);
        assert_abs_diff_eq!(norms[1], 1.0);

        m.divide_row(norms.as_slice().unwrap(), 0, 2);
        assert_abs_diff_eq!(m.at(0, 0), 0.6);
        assert_abs_diff_eq!(m.at(0, 1), 0.8);

        m.multiply_row(&[2.0, 0.0], 0, 2);
        assert_abs_diff_eq!(m.at(0, 0), 1.2);
        // Zero scalar leaves the row untouched.
        assert_abs_diff_eq!(m.at(1, 0), 1.0);
    }

    #[test]
    fn save_load_roundtrip_is_bit_exact() {
        let m = Matrix::new(5, 7);
        m.uniform(&mut MinstdRand::new(1), 1.0 / 7.0);
        let mut cursor = Cursor::new(Vec::new());
        m.write(&mut cursor).unwrap();
        cursor.set_position(0);
        let loaded = Matrix::read(&mut cursor).unwrap();
        assert_eq!(loaded.rows(), 5);
        assert_eq!(loaded.cols(), 7);
        assert_eq!(
            m.to_vec().iter().map(|v| v.to_bits()).collect::<Vec<_>>(),
            loaded.to_vec().iter().map(|v| v.to_bits()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn concurrent_updates_do_not_lose_the_matrix() {
        // Hogwild updates race benignly; the result only has to stay a
        // valid finite f32 per cell.
        let m = Matrix::new(1, 8);
        let done = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..1000 {
                        m.add_row(&[1.0; 8], 0, 0.001);
                    }
                    done.fetch_add(1, Ordering::SeqCst);
                });
            }
        });
        assert_eq!(done.load(Ordering::SeqCst), 4);
        assert!(m.row(0).iter().all(|v| v.is_finite() && *v > 0.0));
    }
}
