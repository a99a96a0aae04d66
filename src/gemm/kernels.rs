use super::GemmConfig;

/// One batch entry of a GEMM call, row-major with explicit leading
/// dimensions. `transa`/`transb` select op(A)/op(B) like the BLAS flags.
pub struct GemmArgs<'a> {
    pub transa: bool,
    pub transb: bool,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub alpha: f32,
    pub beta: f32,
    pub a: &'a [f32],
    pub lda: usize,
    pub b: &'a [f32],
    pub ldb: usize,
    pub c: &'a mut [f32],
    pub ldc: usize,
}

impl<'a> GemmArgs<'a> {
    #[inline]
    fn a_at(&self, i: usize, l: usize) -> f32 {
        if self.transa {
            self.a[l * self.lda + i]
        } else {
            self.a[i * self.lda + l]
        }
    }

    #[inline]
    fn b_at(&self, l: usize, j: usize) -> f32 {
        if self.transb {
            self.b[j * self.ldb + l]
        } else {
            self.b[l * self.ldb + j]
        }
    }
}

/// A candidate GEMM implementation
pub trait GemmKernel {
    fn name(&self) -> &'static str;
    /// Whether this implementation can handle the given config
    fn supports(&self, _cfg: &GemmConfig) -> bool {
        true
    }
    fn run(&self, args: GemmArgs);
}

/// The implementations a dispatch object enumerates by default
pub fn default_kernels() -> Vec<Box<dyn GemmKernel>> {
    vec![
        Box::new(NaiveGemm),
        Box::new(IkjGemm),
        Box::new(MatrixMultiplyGemm),
    ]
}

/// Scalar reference kernel, dot product per output element
pub struct NaiveGemm;

impl GemmKernel for NaiveGemm {
    fn name(&self) -> &'static str {
        "GemmNaive"
    }

    fn run(&self, mut args: GemmArgs) {
        for i in 0..args.m {
            for j in 0..args.n {
                let mut acc = 0.0f32;
                for l in 0..args.k {
                    acc += args.a_at(i, l) * args.b_at(l, j);
                }
                let out = args.alpha * acc + args.beta * args.c[i * args.ldc + j];
                args.c[i * args.ldc + j] = out;
            }
        }
    }
}

/// Loop-reordered kernel with the j loop innermost so the C row streams.
/// Assumes op(A) reads are cheap, so only non-transposed A is claimed.
pub struct IkjGemm;

impl GemmKernel for IkjGemm {
    fn name(&self) -> &'static str {
        "GemmIkj"
    }

    fn supports(&self, cfg: &GemmConfig) -> bool {
        !cfg.transa
    }

    fn run(&self, args: GemmArgs) {
        let GemmArgs {
            transb,
            m,
            n,
            k,
            alpha,
            beta,
            a,
            lda,
            b,
            ldb,
            c,
            ldc,
            ..
        } = args;
        for i in 0..m {
            for j in 0..n {
                c[i * ldc + j] *= beta;
            }
        }
        for i in 0..m {
            for l in 0..k {
                let av = alpha * a[i * lda + l];
                let row = &mut c[i * ldc..i * ldc + n];
                if transb {
                    for (j, out) in row.iter_mut().enumerate() {
                        *out += av * b[j * ldb + l];
                    }
                } else {
                    for (j, out) in row.iter_mut().enumerate() {
                        *out += av * b[l * ldb + j];
                    }
                }
            }
        }
    }
}

/// matrixmultiply-backed kernel; transposes become stride swaps
pub struct MatrixMultiplyGemm;

impl GemmKernel for MatrixMultiplyGemm {
    fn name(&self) -> &'static str {
        "GemmMatrixMultiply"
    }

    fn run(&self, args: GemmArgs) {
        let (rsa, csa) = if args.transa {
            (1, args.lda as isize)
        } else {
            (args.lda as isize, 1)
        };
        let (rsb, csb) = if args.transb {
            (1, args.ldb as isize)
        } else {
            (args.ldb as isize, 1)
        };
        unsafe {
            matrixmultiply::sgemm(
                args.m,
                args.k,
                args.n,
                args.alpha,
                args.a.as_ptr(),
                rsa,
                csa,
                args.b.as_ptr(),
                rsb,
                csb,
                args.beta,
                args.c.as_mut_ptr(),
                args.ldc as isize,
                1,
            );
        }
    }
}
