use colored::Colorize;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rustc_hash::FxHashMap;

use super::{BatchedGemm, DeviceArray, Dtype, GemmConfig};

/// A generated batched GEMM case: quantized inputs, the f64 reference
/// product per batch entry, and the relative-error bound each candidate
/// implementation must stay within.
pub struct GemmCase {
    pub cfg: GemmConfig,
    a: Vec<Vec<f32>>,
    b: Vec<Vec<f32>>,
    refs: Vec<Vec<f64>>,
    bounds: Vec<f64>,
    lda: usize,
    ldb: usize,
    ldc: usize,
}

impl GemmCase {
    /// Generate inputs uniform in [0.5, 1.5), quantized to the case dtype,
    /// then compute the reference and the error bound from the quantized
    /// values (so only the kernel's own arithmetic is measured).
    pub fn generate(cfg: GemmConfig, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let (a_rows, a_cols) = cfg.a_shape();
        let (b_rows, b_cols) = cfg.b_shape();
        let mut a = Vec::with_capacity(cfg.batch);
        let mut b = Vec::with_capacity(cfg.batch);
        let mut refs = Vec::with_capacity(cfg.batch);
        let mut bounds = Vec::with_capacity(cfg.batch);
        for _ in 0..cfg.batch {
            let a_i: Vec<f32> = (0..a_rows * a_cols)
                .map(|_| cfg.dtype.quantize(rng.gen::<f64>() + 0.5))
                .collect();
            let b_i: Vec<f32> = (0..b_rows * b_cols)
                .map(|_| cfg.dtype.quantize(rng.gen::<f64>() + 0.5))
                .collect();
            let a_f64: Vec<f64> = a_i.iter().map(|x| *x as f64).collect();
            let b_f64: Vec<f64> = b_i.iter().map(|x| *x as f64).collect();
            let ref_c = reference_product(&cfg, &a_f64, &b_f64, a_cols, b_cols);
            bounds.push(gemm_bound(cfg.dtype, cfg.k, &a_f64, &b_f64, &ref_c, &cfg));
            refs.push(ref_c);
            a.push(a_i);
            b.push(b_i);
        }
        Self {
            cfg,
            a,
            b,
            refs,
            bounds,
            lda: a_cols,
            ldb: b_cols,
            ldc: cfg.n,
        }
    }

    /// Build a fresh dispatch object over this case's buffers
    pub fn dispatch(&self) -> BatchedGemm {
        BatchedGemm::new(
            self.cfg,
            1.0,
            self.a.iter().map(|a| DeviceArray::new(a.clone())).collect(),
            self.lda,
            self.b.iter().map(|b| DeviceArray::new(b.clone())).collect(),
            self.ldb,
            0.0,
            (0..self.cfg.batch)
                .map(|_| DeviceArray::zeros(self.cfg.m * self.cfg.n))
                .collect(),
            self.ldc,
        )
    }

    pub fn max_bound(&self) -> f64 {
        self.bounds.iter().copied().fold(0.0, f64::max)
    }

    /// Run every selectable implementation and collect numeric mismatches.
    /// Failures are reported in aggregate, not raised on first hit.
    pub fn validate(&self) -> FxHashMap<String, String> {
        self.validate_dispatch(self.dispatch())
    }

    pub fn validate_dispatch(&self, mut my_gemm: BatchedGemm) -> FxHashMap<String, String> {
        let cfg = self.cfg;
        println!(
            "dtype={} {} m={:<5} n={:<5} k={:<5} batch={:<3} max bound: {:.3e}",
            cfg.dtype.suffix(),
            cfg.transab_suffix(),
            cfg.m,
            cfg.n,
            cfg.k,
            cfg.batch,
            self.max_bound()
        );

        let mut failures = FxHashMap::default();
        for op in my_gemm.list_ops() {
            if !my_gemm.select_op(op) {
                continue;
            }
            my_gemm.run();
            'batches: for i in 0..cfg.batch {
                let out = my_gemm.output(i);
                let mut max_rel = 0.0f64;
                let mut worst = 0;
                for (idx, (x, r)) in out.iter().zip(&self.refs[i]).enumerate() {
                    let rel = (*x as f64 - r).abs() / r.abs().max(f64::MIN_POSITIVE);
                    if rel > max_rel {
                        max_rel = rel;
                        worst = idx;
                    }
                }
                if max_rel > self.bounds[i] {
                    let message = format!(
                        "batch {i}: max relative error {max_rel:.3e} exceeds bound {:.3e} at element {worst}",
                        self.bounds[i]
                    );
                    println!("{}", format!("{:*<30}{}{:*<30}", "", op, "").red());
                    println!("{message}");
                    failures.insert(op.to_string(), message);
                    break 'batches;
                }
            }
        }
        failures
    }
}

/// Relative-error bound for one batch entry: the forward dot-product bound
/// `gamma_k * max (|A||B|) / |C|` for f32 accumulation, plus one unit of
/// output rounding in the case dtype.
pub fn gemm_bound(
    dtype: Dtype,
    k: usize,
    a: &[f64],
    b: &[f64],
    ref_c: &[f64],
    cfg: &GemmConfig,
) -> f64 {
    let eps_acc = f32::EPSILON as f64;
    let ke = k as f64 * eps_acc;
    let gamma = ke / (1.0 - ke);
    let abs_a: Vec<f64> = a.iter().map(|x| x.abs()).collect();
    let abs_b: Vec<f64> = b.iter().map(|x| x.abs()).collect();
    let abs_prod = reference_product(cfg, &abs_a, &abs_b, cfg.a_shape().1, cfg.b_shape().1);
    let ratio = abs_prod
        .iter()
        .zip(ref_c)
        .map(|(p, c)| p / c.abs().max(f64::MIN_POSITIVE))
        .fold(0.0, f64::max);
    gamma * ratio + dtype.epsilon()
}

/// f64 matrix product op(A) * op(B) with row-major storage
fn reference_product(cfg: &GemmConfig, a: &[f64], b: &[f64], lda: usize, ldb: usize) -> Vec<f64> {
    let mut c = vec![0.0; cfg.m * cfg.n];
    let (rsa, csa) = if cfg.transa {
        (1, lda as isize)
    } else {
        (lda as isize, 1)
    };
    let (rsb, csb) = if cfg.transb {
        (1, ldb as isize)
    } else {
        (ldb as isize, 1)
    };
    unsafe {
        matrixmultiply::dgemm(
            cfg.m,
            cfg.k,
            cfg.n,
            1.0,
            a.as_ptr(),
            rsa,
            csa,
            b.as_ptr(),
            rsb,
            csb,
            0.0,
            c.as_mut_ptr(),
            cfg.n as isize,
            1,
        );
    }
    c
}

/// Time every candidate implementation for one config and print time and
/// throughput per implementation
pub fn profile_with_args(cfg: GemmConfig, seed: u64) {
    let case = GemmCase::generate(cfg, seed);
    let mut my_gemm = case.dispatch();
    for op in my_gemm.list_ops() {
        if !my_gemm.select_op(op) {
            println!(
                "{:<24} {} {} m={:<4} n={:<4} k={:<4} batch={:<3} {}",
                op,
                cfg.dtype.suffix(),
                cfg.transab_suffix(),
                cfg.m,
                cfg.n,
                cfg.k,
                cfg.batch,
                "not supported".yellow()
            );
            continue;
        }
        let time_ms = my_gemm.profile();
        let time_us = time_ms * 1e3;
        let tflops = (cfg.batch * cfg.m * cfg.k * cfg.n * 2) as f64 / (time_ms * 1e-3) / 1e12;
        println!(
            "{:<24} {} {} m={:<4} n={:<4} k={:<4} batch={:<3} {:>10.4} us {:>6.2} tflops",
            op.bold(),
            cfg.dtype.suffix(),
            cfg.transab_suffix(),
            cfg.m,
            cfg.n,
            cfg.k,
            cfg.batch,
            time_us,
            tflops
        );
    }
}

/// Full profiling sweep over the transformer-sized cases
pub fn profile_all(seed: u64) {
    let width = (term_size::dimensions()
        .map(|(w, _)| w)
        .unwrap_or(80)
        .saturating_sub(" Profiling ".len()))
        / 2;
    println!("{:->width$} Profiling {:->width$}", "", "");
    for dtype in [Dtype::F32, Dtype::F16] {
        for (m, n, k) in bert_sizes() {
            for batch in [1, 32, 64] {
                profile_with_args(GemmConfig::new(dtype, false, false, m, n, k, batch), seed);
            }
        }
        println!();
    }
}

/// Small shape grid covering degenerate and ragged sizes
pub fn basic_sizes() -> Vec<(usize, usize, usize)> {
    vec![(1, 1, 1), (3, 4, 5), (16, 16, 16), (127, 129, 65)]
}

/// Typical transformer layer shapes
pub fn bert_sizes() -> Vec<(usize, usize, usize)> {
    vec![
        (384, 768, 768),
        (384, 768, 3072),
        (384, 3072, 768),
        (384, 1024, 1024),
    ]
}
