use fluxrust_core::{Buffer, HostMatrix};

// Shared helpers for the integration suites. Each test binary compiles its
// own copy, so anything unused in one binary is expected dead code there.

#[allow(dead_code)]
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[allow(dead_code)]
pub fn read_f32(buffer: &Buffer) -> HostMatrix<f32> {
    buffer
        .to_host::<f32>()
        .expect("test buffer should be f32-readable")
}

#[allow(dead_code)]
pub fn assert_matrix_close(actual: &HostMatrix<f32>, expected: &HostMatrix<f32>, epsilon: f32) {
    assert_eq!(
        actual.shape(),
        expected.shape(),
        "extents differ: {:?} vs {:?}",
        actual.shape(),
        expected.shape()
    );
    for j in 0..expected.ncols() {
        for i in 0..expected.nrows() {
            approx::assert_abs_diff_eq!(
                actual.get(i, j),
                expected.get(i, j),
                epsilon = epsilon
            );
        }
    }
}

/// Plain host-side matrix product, the oracle for the gemm tests.
#[allow(dead_code)]
pub fn host_matmul(a: &HostMatrix<f32>, b: &HostMatrix<f32>) -> HostMatrix<f32> {
    assert_eq!(a.ncols(), b.nrows());
    HostMatrix::from_fn(a.nrows(), b.ncols(), |i, j| {
        (0..a.ncols()).map(|k| a.get(i, k) * b.get(k, j)).sum()
    })
}
