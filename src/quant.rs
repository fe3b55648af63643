//! Product quantization of embedding matrices.
//!
//! Rows are cut into `dsub`-wide slices, each quantized against its own
//! codebook of 256 centroids trained with Lloyd's algorithm. A row is
//! then one code byte per slice; with norm quantization an extra 1-dim
//! quantizer codes the original row norm.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rand::seq::SliceRandom;

use crate::error::{Error, Result};
use crate::matrix::Matrix;
use crate::rng::MinstdRand;

const NBITS: usize = 8;
/// Centroids per sub-quantizer.
pub const KSUB: usize = 1 << NBITS;
const MAX_POINTS_PER_CLUSTER: usize = 256;
const MAX_POINTS: usize = MAX_POINTS_PER_CLUSTER * KSUB;
const SEED: u64 = 1234;
const NITER: usize = 25;
const EPS: f32 = 1e-7;

fn dist_l2(x: &[f32], y: &[f32], d: usize) -> f32 {
    let mut dist = 0.0;
    for i in 0..d {
        let tmp = x[i] - y[i];
        dist += tmp * tmp;
    }
    dist
}

/// A trained product quantizer over vectors of length `dim`.
pub struct ProductQuantizer {
    dim: usize,
    nsubq: usize,
    dsub: usize,
    lastdsub: usize,
    centroids: Vec<f32>,
    rng: MinstdRand,
}

impl ProductQuantizer {
    pub fn new(dim: usize, dsub: usize) -> Self {
        let mut nsubq = dim / dsub;
        let mut lastdsub = dim % dsub;
        if lastdsub == 0 {
            lastdsub = dsub;
        } else {
            nsubq += 1;
        }
        ProductQuantizer {
            dim,
            nsubq,
            dsub,
            lastdsub,
            centroids: vec![0.0; dim * KSUB],
            rng: MinstdRand::new(SEED),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Code bytes per quantized vector.
    pub fn nsubq(&self) -> usize {
        self.nsubq
    }

    fn subq_width(&self, m: usize) -> usize {
        if m == self.nsubq - 1 {
            self.lastdsub
        } else {
            self.dsub
        }
    }

    /// Centroid `i` of sub-quantizer `m`.
    pub fn centroid(&self, m: usize, i: u8) -> &[f32] {
        let d = self.subq_width(m);
        let offset = if m == self.nsubq - 1 {
            m * KSUB * self.dsub + i as usize * self.lastdsub
        } else {
            (m * KSUB + i as usize) * self.dsub
        };
        &self.centroids[offset..offset + d]
    }

    fn centroid_offset(&self, m: usize, i: u8) -> usize {
        if m == self.nsubq - 1 {
            m * KSUB * self.dsub + i as usize * self.lastdsub
        } else {
            (m * KSUB + i as usize) * self.dsub
        }
    }

    /// Nearest centroid of the slice codebook starting at
    /// `centroids[c0]`; writes the code byte and returns the distance.
    fn assign_centroid(centroids: &[f32], c0: usize, x: &[f32], code: &mut u8, d: usize) -> f32 {
        let mut dis = dist_l2(x, &centroids[c0..c0 + d], d);
        *code = 0;
        for j in 1..KSUB {
            let c = c0 + j * d;
            let disij = dist_l2(x, &centroids[c..c + d], d);
            if disij < dis {
                *code = j as u8;
                dis = disij;
            }
        }
        dis
    }

    fn estep(x: &[f32], centroids: &[f32], c0: usize, codes: &mut [u8], d: usize, n: usize) {
        for i in 0..n {
            Self::assign_centroid(centroids, c0, &x[i * d..i * d + d], &mut codes[i], d);
        }
    }

    fn mstep(
        rng: &mut MinstdRand,
        x: &[f32],
        centroids: &mut [f32],
        c0: usize,
        codes: &[u8],
        d: usize,
        n: usize,
    ) {
        let mut nelts = [0i32; KSUB];
        centroids[c0..c0 + d * KSUB].iter_mut().for_each(|c| *c = 0.0);

        for i in 0..n {
            let k = codes[i] as usize;
            let c = c0 + k * d;
            for j in 0..d {
                centroids[c + j] += x[i * d + j];
            }
            nelts[k] += 1;
        }
        for k in 0..KSUB {
            let z = nelts[k] as f32;
            if z != 0.0 {
                let c = c0 + k * d;
                for j in 0..d {
                    centroids[c + j] /= z;
                }
            }
        }

        // Empty-cluster repair: steal a heavy centroid picked by
        // rejection sampling weighted by cluster size, then perturb
        // both copies in opposite directions so they diverge.
        for k in 0..KSUB {
            if nelts[k] != 0 {
                continue;
            }
            let mut m = 0;
            while rng.uniform_unit() * (n - KSUB) as f64 >= f64::from(nelts[m] - 1) {
                m = (m + 1) % KSUB;
            }
            let (kd, md) = (c0 + k * d, c0 + m * d);
            for j in 0..d {
                centroids[kd + j] = centroids[md + j];
            }
            for j in 0..d {
                let sign = ((j % 2) as f32 * 2.0 - 1.0) * EPS;
                centroids[kd + j] += sign;
                centroids[md + j] -= sign;
            }
            nelts[k] = nelts[m] / 2;
            nelts[m] -= nelts[k];
        }
    }

    fn kmeans(&mut self, x: &[f32], c0: usize, n: usize, d: usize) {
        let mut perm: Vec<usize> = (0..n).collect();
        perm.shuffle(&mut self.rng);
        for i in 0..KSUB {
            let dst = c0 + i * d;
            let src = perm[i] * d;
            self.centroids[dst..dst + d].copy_from_slice(&x[src..src + d]);
        }
        let mut codes = vec![0u8; n];
        for _ in 0..NITER {
            Self::estep(x, &self.centroids, c0, &mut codes, d, n);
            Self::mstep(&mut self.rng, x, &mut self.centroids, c0, &codes, d, n);
        }
    }

    /// Train all sub-quantizers on `n` rows of row-major `data`.
    pub fn train(&mut self, n: usize, data: &[f32]) -> Result<()> {
        if n < KSUB {
            return Err(Error::invalid_argument(
                "Matrix too small for quantization, must have at least 256 rows",
            ));
        }
        let mut perm: Vec<usize> = (0..n).collect();
        let np = n.min(MAX_POINTS);
        let mut xslice = vec![0f32; np * self.dsub];
        for m in 0..self.nsubq {
            let d = self.subq_width(m);
            if np != n {
                perm.shuffle(&mut self.rng);
            }
            for (j, &row) in perm.iter().enumerate().take(np) {
                let src = row * self.dim + m * self.dsub;
                xslice[j * d..j * d + d].copy_from_slice(&data[src..src + d]);
            }
            let c0 = self.centroid_offset(m, 0);
            self.kmeans(&xslice, c0, np, d);
        }
        Ok(())
    }

    /// Quantize one vector into `nsubq` code bytes.
    pub fn compute_code(&self, x: &[f32], code: &mut [u8]) {
        for m in 0..self.nsubq {
            let d = self.subq_width(m);
            let c0 = self.centroid_offset(m, 0);
            Self::assign_centroid(
                &self.centroids,
                c0,
                &x[m * self.dsub..m * self.dsub + d],
                &mut code[m],
                d,
            );
        }
    }

    /// Quantize `n` row-major vectors.
    pub fn compute_codes(&self, data: &[f32], codes: &mut [u8], n: usize) {
        for i in 0..n {
            let x = &data[i * self.dim..(i + 1) * self.dim];
            self.compute_code(x, &mut codes[i * self.nsubq..(i + 1) * self.nsubq]);
        }
    }

    /// `α · ⟨x, decode(codes, t)⟩` without materializing the row.
    pub fn mul_code(&self, x: &[f32], codes: &[u8], t: usize, alpha: f32) -> f32 {
        let mut res = 0.0;
        let code = &codes[self.nsubq * t..self.nsubq * (t + 1)];
        for m in 0..self.nsubq {
            let d = self.subq_width(m);
            let c = self.centroid(m, code[m]);
            for n in 0..d {
                res += x[m * self.dsub + n] * c[n];
            }
        }
        res * alpha
    }

    /// `x += α · decode(codes, t)`.
    pub fn add_code(&self, x: &mut [f32], codes: &[u8], t: usize, alpha: f32) {
        let code = &codes[self.nsubq * t..self.nsubq * (t + 1)];
        for m in 0..self.nsubq {
            let d = self.subq_width(m);
            let c = self.centroid(m, code[m]);
            for n in 0..d {
                x[m * self.dsub + n] += alpha * c[n];
            }
        }
    }

    pub fn write(&self, write: &mut impl Write) -> Result<()> {
        let mut put = |v: i32, what: &str| -> Result<()> {
            write
                .write_i32::<LittleEndian>(v)
                .map_err(|e| Error::write_error(format!("Cannot write {}", what), e))
        };
        put(self.dim as i32, "quantizer dim")?;
        put(self.nsubq as i32, "number of subquantizers")?;
        put(self.dsub as i32, "subquantizer width")?;
        put(self.lastdsub as i32, "last subquantizer width")?;
        for &c in &self.centroids {
            write
                .write_f32::<LittleEndian>(c)
                .map_err(|e| Error::write_error("Cannot write centroid", e))?;
        }
        Ok(())
    }

    pub fn read(read: &mut impl Read) -> Result<ProductQuantizer> {
        let mut get = |what: &str| -> Result<i32> {
            read.read_i32::<LittleEndian>()
                .map_err(|e| Error::read_error(format!("Cannot read {}", what), e))
        };
        let dim = get("quantizer dim")? as usize;
        let nsubq = get("number of subquantizers")? as usize;
        let dsub = get("subquantizer width")? as usize;
        let lastdsub = get("last subquantizer width")? as usize;

        let mut centroids = vec![0f32; dim * KSUB];
        read.read_f32_into::<LittleEndian>(&mut centroids)
            .map_err(|e| Error::read_error("Cannot read centroids", e))?;

        Ok(ProductQuantizer {
            dim,
            nsubq,
            dsub,
            lastdsub,
            centroids,
            rng: MinstdRand::new(SEED),
        })
    }
}

/// A product-quantized matrix: per-row code bytes plus an optional
/// 1-dim quantizer for the row norms.
pub struct QMatrix {
    qnorm: bool,
    rows: usize,
    cols: usize,
    codesize: usize,
    codes: Vec<u8>,
    norm_codes: Vec<u8>,
    pq: ProductQuantizer,
    npq: Option<ProductQuantizer>,
}

impl QMatrix {
    /// Quantize a dense matrix.
    pub fn quantize(matrix: &Matrix, dsub: usize, qnorm: bool) -> Result<QMatrix> {
        let rows = matrix.rows();
        let cols = matrix.cols();
        let codesize = rows * ((cols + dsub - 1) / dsub);
        let mut codes = vec![0u8; codesize];
        let mut pq = ProductQuantizer::new(cols, dsub);

        let (data, norm_codes, npq) = if qnorm {
            let work = matrix.copy();
            let norms = work.l2_norm_row()?;
            let norms = norms.to_vec();
            work.divide_row(&norms, 0, rows);

            let mut npq = ProductQuantizer::new(1, 1);
            npq.train(rows, &norms)?;
            let mut norm_codes = vec![0u8; rows];
            npq.compute_codes(&norms, &mut norm_codes, rows);
            (work.to_vec(), norm_codes, Some(npq))
        } else {
            (matrix.to_vec(), Vec::new(), None)
        };

        pq.train(rows, &data)?;
        pq.compute_codes(&data, &mut codes, rows);

        Ok(QMatrix {
            qnorm,
            rows,
            cols,
            codesize,
            codes,
            norm_codes,
            pq,
            npq,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    fn norm(&self, i: usize) -> f32 {
        match &self.npq {
            Some(npq) => npq.centroid(0, self.norm_codes[i])[0],
            None => 1.0,
        }
    }

    /// `⟨decode(row_i), vec⟩`.
    pub fn dot_row(&self, vec: &[f32], i: usize) -> f32 {
        debug_assert!(i < self.rows);
        debug_assert_eq!(vec.len(), self.cols);
        self.pq.mul_code(vec, &self.codes, i, self.norm(i))
    }

    /// `dst += decode(row_i)`.
    pub fn add_row_to(&self, dst: &mut [f32], i: usize) {
        debug_assert!(i < self.rows);
        self.pq.add_code(dst, &self.codes, i, self.norm(i));
    }

    pub fn write(&self, write: &mut impl Write) -> Result<()> {
        write
            .write_u8(self.qnorm as u8)
            .map_err(|e| Error::write_error("Cannot write norm quantization flag", e))?;
        write
            .write_i64::<LittleEndian>(self.rows as i64)
            .map_err(|e| Error::write_error("Cannot write number of quantized rows", e))?;
        write
            .write_i64::<LittleEndian>(self.cols as i64)
            .map_err(|e| Error::write_error("Cannot write number of quantized columns", e))?;
        write
            .write_i32::<LittleEndian>(self.codesize as i32)
            .map_err(|e| Error::write_error("Cannot write code size", e))?;
        write
            .write_all(&self.codes)
            .map_err(|e| Error::write_error("Cannot write codes", e))?;
        self.pq.write(write)?;
        if self.qnorm {
            write
                .write_all(&self.norm_codes)
                .map_err(|e| Error::write_error("Cannot write norm codes", e))?;
            self.npq
                .as_ref()
                .expect("norm quantizer present when qnorm is set")
                .write(write)?;
        }
        Ok(())
    }

    pub fn read(read: &mut impl Read) -> Result<QMatrix> {
        let qnorm = read
            .read_u8()
            .map_err(|e| Error::read_error("Cannot read norm quantization flag", e))?
            != 0;
        let rows = read
            .read_i64::<LittleEndian>()
            .map_err(|e| Error::read_error("Cannot read number of quantized rows", e))?
            as usize;
        let cols = read
            .read_i64::<LittleEndian>()
            .map_err(|e| Error::read_error("Cannot read number of quantized columns", e))?
            as usize;
        let codesize = read
            .read_i32::<LittleEndian>()
            .map_err(|e| Error::read_error("Cannot read code size", e))? as usize;

        let mut codes = vec![0u8; codesize];
        read.read_exact(&mut codes)
            .map_err(|e| Error::read_error("Cannot read codes", e))?;
        let pq = ProductQuantizer::read(read)?;

        let (norm_codes, npq) = if qnorm {
            let mut norm_codes = vec![0u8; rows];
            read.read_exact(&mut norm_codes)
                .map_err(|e| Error::read_error("Cannot read norm codes", e))?;
            (norm_codes, Some(ProductQuantizer::read(read)?))
        } else {
            (Vec::new(), None)
        };

        Ok(QMatrix {
            qnorm,
            rows,
            cols,
            codesize,
            codes,
            norm_codes,
            pq,
            npq,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use approx::assert_abs_diff_eq;

    use super::{ProductQuantizer, QMatrix, KSUB};
    use crate::matrix::Matrix;
    use crate::rng::MinstdRand;

    fn test_matrix(rows: usize, cols: usize) -> Matrix {
        let m = Matrix::new(rows, cols);
        m.uniform(&mut MinstdRand::new(1), 1.0);
        m
    }

    #[test]
    fn rejects_small_input() {
        let mut pq = ProductQuantizer::new(4, 2);
        let data = vec![0f32; 4 * 100];
        assert!(pq.train(100, &data).is_err());
    }

    #[test]
    fn uneven_dim_gets_a_final_subquantizer() {
        let pq = ProductQuantizer::new(5, 2);
        assert_eq!(pq.nsubq(), 3);
        let pq = ProductQuantizer::new(6, 2);
        assert_eq!(pq.nsubq(), 3);
    }

    #[test]
    fn quantization_error_is_bounded() {
        let matrix = test_matrix(KSUB + 44, 8);
        let q = QMatrix::quantize(&matrix, 2, false).unwrap();

        // Reconstructed rows stay close to the originals relative to
        // the data scale; dot products against a probe agree loosely.
        let probe = vec![1.0f32; 8];
        let mut total_err = 0.0;
        for i in 0..matrix.rows() {
            let exact = matrix.dot_row(&probe, i).unwrap();
            let approx = q.dot_row(&probe, i);
            total_err += (exact - approx).abs();
        }
        assert!(total_err / (matrix.rows() as f32) < 1.0);
    }

    #[test]
    fn norm_quantization_preserves_scale() {
        let matrix = test_matrix(KSUB + 10, 6);
        let q = QMatrix::quantize(&matrix, 2, true).unwrap();
        for i in 0..matrix.rows() {
            let mut reconstructed = vec![0f32; 6];
            q.add_row_to(&mut reconstructed, i);
            let exact: Vec<f32> = matrix.row(i);
            let exact_norm: f32 = exact.iter().map(|v| v * v).sum::<f32>().sqrt();
            let rec_norm: f32 = reconstructed.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((exact_norm - rec_norm).abs() / exact_norm < 0.5);
        }
    }

    #[test]
    fn mul_code_matches_add_code() {
        let matrix = test_matrix(KSUB, 4);
        let q = QMatrix::quantize(&matrix, 2, false).unwrap();
        let probe = [0.5f32, -1.0, 2.0, 0.25];
        for i in (0..matrix.rows()).step_by(37) {
            let mut row = vec![0f32; 4];
            q.add_row_to(&mut row, i);
            let dot: f32 = row.iter().zip(probe.iter()).map(|(a, b)| a * b).sum();
            assert_abs_diff_eq!(dot, q.dot_row(&probe, i), epsilon = 1e-4);
        }
    }

    #[test]
    fn qmatrix_roundtrip_is_bit_exact() {
        let matrix = test_matrix(KSUB + 3, 6);
        let q = QMatrix::quantize(&matrix, 2, true).unwrap();
        let mut cursor = Cursor::new(Vec::new());
        q.write(&mut cursor).unwrap();
        cursor.set_position(0);
        let loaded = QMatrix::read(&mut cursor).unwrap();

        assert_eq!(loaded.rows(), q.rows());
        assert_eq!(loaded.cols(), q.cols());
        let probe = vec![0.3f32; 6];
        for i in 0..q.rows() {
            assert_eq!(
                q.dot_row(&probe, i).to_bits(),
                loaded.dot_row(&probe, i).to_bits()
            );
        }
    }

    #[test]
    fn quantizer_training_is_deterministic() {
        let matrix = test_matrix(KSUB + 20, 4);
        let a = QMatrix::quantize(&matrix, 2, false).unwrap();
        let b = QMatrix::quantize(&matrix, 2, false).unwrap();
        let probe = vec![1.0f32, 0.0, -1.0, 0.5];
        for i in 0..matrix.rows() {
            assert_eq!(
                a.dot_row(&probe, i).to_bits(),
                b.dot_row(&probe, i).to_bits()
            );
        }
    }
}
