mod harness;
mod kernels;

pub use harness::*;
pub use kernels::*;

use half::f16;

/// Element type of a GEMM case. Storage is simulated on f32 buffers; F16
/// rounds values through half precision at quantization and after each run,
/// the way accumulate-in-f32 tensor paths behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dtype {
    F32,
    F16,
}

impl Dtype {
    pub fn epsilon(&self) -> f64 {
        match self {
            Dtype::F32 => f32::EPSILON as f64,
            Dtype::F16 => f16::EPSILON.to_f64(),
        }
    }

    /// Round a generated value to what the device buffer would hold
    pub fn quantize(&self, x: f64) -> f32 {
        match self {
            Dtype::F32 => x as f32,
            Dtype::F16 => f16::from_f64(x).to_f32(),
        }
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            Dtype::F32 => "float",
            Dtype::F16 => "half",
        }
    }
}

/// One batched GEMM test/profile case. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemmConfig {
    pub dtype: Dtype,
    pub transa: bool,
    pub transb: bool,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub batch: usize,
}

impl GemmConfig {
    pub fn new(
        dtype: Dtype,
        transa: bool,
        transb: bool,
        m: usize,
        n: usize,
        k: usize,
        batch: usize,
    ) -> Self {
        Self {
            dtype,
            transa,
            transb,
            m,
            n,
            k,
            batch,
        }
    }

    /// Stored (rows, cols) of A, before op(A)
    pub fn a_shape(&self) -> (usize, usize) {
        if self.transa {
            (self.k, self.m)
        } else {
            (self.m, self.k)
        }
    }

    /// Stored (rows, cols) of B, before op(B)
    pub fn b_shape(&self) -> (usize, usize) {
        if self.transb {
            (self.n, self.k)
        } else {
            (self.k, self.n)
        }
    }

    /// "NN" / "NT" / "TN" / "TT"
    pub fn transab_suffix(&self) -> String {
        let f = |t: bool| if t { 'T' } else { 'N' };
        format!("{}{}", f(self.transa), f(self.transb))
    }
}

/// A buffer handle standing in for the device-side allocation
#[derive(Debug, Clone)]
pub struct DeviceArray {
    data: Vec<f32>,
}

impl DeviceArray {
    pub fn new(data: Vec<f32>) -> Self {
        Self { data }
    }

    pub fn zeros(len: usize) -> Self {
        Self {
            data: vec![0.0; len],
        }
    }

    /// Host view of the buffer
    pub fn host(&self) -> &[f32] {
        &self.data
    }
}

/// Batched GEMM dispatch object. Holds the problem description and the
/// buffers, enumerates candidate implementations, and runs or profiles the
/// selected one over every batch entry.
pub struct BatchedGemm {
    cfg: GemmConfig,
    alpha: f32,
    beta: f32,
    a: Vec<DeviceArray>,
    lda: usize,
    b: Vec<DeviceArray>,
    ldb: usize,
    c: Vec<DeviceArray>,
    ldc: usize,
    kernels: Vec<Box<dyn GemmKernel>>,
    selected: Option<usize>,
}

impl BatchedGemm {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: GemmConfig,
        alpha: f32,
        a: Vec<DeviceArray>,
        lda: usize,
        b: Vec<DeviceArray>,
        ldb: usize,
        beta: f32,
        c: Vec<DeviceArray>,
        ldc: usize,
    ) -> Self {
        assert_eq!(a.len(), cfg.batch);
        assert_eq!(b.len(), cfg.batch);
        assert_eq!(c.len(), cfg.batch);
        Self {
            cfg,
            alpha,
            beta,
            a,
            lda,
            b,
            ldb,
            c,
            ldc,
            kernels: default_kernels(),
            selected: None,
        }
    }

    /// Swap in a custom candidate set
    pub fn with_kernels(mut self, kernels: Vec<Box<dyn GemmKernel>>) -> Self {
        self.kernels = kernels;
        self.selected = None;
        self
    }

    pub fn config(&self) -> &GemmConfig {
        &self.cfg
    }

    /// Names of all candidate implementations
    pub fn list_ops(&self) -> Vec<&'static str> {
        self.kernels.iter().map(|k| k.name()).collect()
    }

    /// Select an implementation by name. Returns false when the name is
    /// unknown or the implementation does not support this config.
    pub fn select_op(&mut self, name: &str) -> bool {
        match self
            .kernels
            .iter()
            .position(|k| k.name() == name && k.supports(&self.cfg))
        {
            Some(i) => {
                self.selected = Some(i);
                true
            }
            None => {
                self.selected = None;
                false
            }
        }
    }

    /// Run the selected implementation over every batch entry
    pub fn run(&mut self) {
        let Some(selected) = self.selected else {
            return;
        };
        let kernel = &self.kernels[selected];
        for i in 0..self.cfg.batch {
            kernel.run(GemmArgs {
                transa: self.cfg.transa,
                transb: self.cfg.transb,
                m: self.cfg.m,
                n: self.cfg.n,
                k: self.cfg.k,
                alpha: self.alpha,
                beta: self.beta,
                a: &self.a[i].data,
                lda: self.lda,
                b: &self.b[i].data,
                ldb: self.ldb,
                c: &mut self.c[i].data,
                ldc: self.ldc,
            });
        }
        if self.cfg.dtype == Dtype::F16 {
            for c in &mut self.c {
                for v in &mut c.data {
                    *v = Dtype::F16.quantize(*v as f64);
                }
            }
        }
    }

    /// Median wall time of the selected implementation in milliseconds
    pub fn profile(&mut self) -> f64 {
        const WARMUP: usize = 2;
        const REPEATS: usize = 10;
        for _ in 0..WARMUP {
            self.run();
        }
        let mut times = Vec::with_capacity(REPEATS);
        for _ in 0..REPEATS {
            let start = std::time::Instant::now();
            self.run();
            times.push(start.elapsed().as_secs_f64() * 1e3);
        }
        times.sort_by(|a, b| a.partial_cmp(b).unwrap());
        times[REPEATS / 2]
    }

    /// Host view of the i-th output buffer
    pub fn output(&self, i: usize) -> &[f32] {
        self.c[i].host()
    }
}
