use kfacr::factors::SeriesFactor;
use kfacr::fisher::{FullyConnectedSeriesFB, SeriesApproximation};
use kfacr::{Damping, FisherBlock, KfacConfig, LayerCollection, LayerParams, PiType, Uses};
use nalgebra::{DMatrix, SymmetricEigen};
use numr::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};
use numr::tensor::Tensor;

const DAMPING: f64 = 0.1;

fn cpu_setup() -> (CpuClient, CpuDevice) {
    let device = CpuDevice::new();
    let client = CpuClient::new(device.clone());
    (client, device)
}

fn to_dmatrix(t: &Tensor<CpuRuntime>) -> DMatrix<f64> {
    let [rows, cols] = [t.shape()[0], t.shape()[1]];
    let data: Vec<f64> = t.to_vec::<f32>().into_iter().map(f64::from).collect();
    DMatrix::from_row_slice(rows, cols, &data)
}

fn sym_power(m: &DMatrix<f64>, exp: f64) -> DMatrix<f64> {
    let eigen = SymmetricEigen::new(m.clone());
    let diag = DMatrix::from_diagonal(&eigen.eigenvalues.map(|v| v.powf(exp)));
    &eigen.eigenvectors * diag * eigen.eigenvectors.transpose()
}

/// Per-factor statistics as seen by the closed forms.
struct SeriesStats {
    c0: DMatrix<f64>,
    c1: DMatrix<f64>,
}

impl SeriesStats {
    fn read<F: SeriesFactor<CpuRuntime>>(factor: &F, damping: f64) -> Self {
        let cov = to_dmatrix(factor.get_cov());
        let n = cov.nrows();
        Self {
            c0: cov + DMatrix::identity(n, n) * damping,
            c1: to_dmatrix(&factor.get_cov_dt1().expect("lag-one moment")),
        }
    }

    /// `(L, ψ)`: `C0^{-1/2} sym(C1) C0^{-1/2} = U diag(ψ) Uᵀ`, `L = C0^{-1/2} U`.
    fn option1(&self) -> (DMatrix<f64>, Vec<f64>) {
        let c0_isqrt = sym_power(&self.c0, -0.5);
        let c1_sym = (&self.c1 + self.c1.transpose()) * 0.5;
        let eigen = SymmetricEigen::new(&c0_isqrt * c1_sym * &c0_isqrt);
        (&c0_isqrt * eigen.eigenvectors, eigen.eigenvalues.iter().copied().collect())
    }

    /// `(P, K, μ)`: `P = C1ᵀ C0⁻¹`, `Ψ̂ Ψ̂ᵀ = E diag(μ) Eᵀ`, `K = C0^{-1/2} E`.
    fn option2(&self) -> (DMatrix<f64>, DMatrix<f64>, Vec<f64>) {
        let c0_isqrt = sym_power(&self.c0, -0.5);
        let p = self.c1.transpose() * sym_power(&self.c0, -1.0);
        let psi = &c0_isqrt * &self.c1 * &c0_isqrt;
        let eigen = SymmetricEigen::new(&psi * psi.transpose());
        (p, &c0_isqrt * eigen.eigenvectors, eigen.eigenvalues.iter().copied().collect())
    }
}

fn gamma(x: f64, t: f64) -> f64 {
    (1.0 - x).powi(2) / (t * (1.0 - x * x) - 2.0 * x * (1.0 - x.powf(t)))
}

fn option1_reference(a: &SeriesStats, g: &SeriesStats, z: &DMatrix<f64>, t: f64) -> DMatrix<f64> {
    let (l_a, psi_a) = a.option1();
    let (l_g, psi_g) = g.option1();
    let mut z = l_g.transpose() * z * &l_a;
    for i in 0..z.nrows() {
        for j in 0..z.ncols() {
            z[(i, j)] *= gamma(psi_g[i] * psi_a[j], t);
        }
    }
    &l_g * z * l_a.transpose()
}

fn option2_reference(a: &SeriesStats, g: &SeriesStats, z: &DMatrix<f64>, t: f64) -> DMatrix<f64> {
    let (p_a, k_a, mu_a) = a.option2();
    let (p_g, k_g, mu_g) = g.option2();
    let z = z - &p_g * z * p_a.transpose();
    let mut z = k_g.transpose() * z * &k_a;
    for i in 0..z.nrows() {
        for j in 0..z.ncols() {
            let d = 1.0 - mu_g[i] * mu_a[j];
            z[(i, j)] /= if d == 0.0 { 1.0 } else { d };
        }
    }
    let z = &k_g * z * k_a.transpose();
    let z = &z - p_g.transpose() * &z * &p_a;
    z / t
}

/// Instantiated series block with pi splitting off, so each factor gets
/// `sqrt(DAMPING / T)` under the default normalization.
fn series_block(
    client: &CpuClient,
    option: SeriesApproximation,
    inputs: Uses<Tensor<CpuRuntime>>,
    outputs: Uses<Tensor<CpuRuntime>>,
) -> FullyConnectedSeriesFB<CpuRuntime> {
    let mut block = FullyConnectedSeriesFB::new(false, None, option);
    block.register_additional_tower(&inputs, &outputs);
    let config = KfacConfig::default().with_pi_type(PiType::Off);
    let mut collection = LayerCollection::new(config).expect("valid config");
    block
        .instantiate_factors(client, &mut collection, &[vec![outputs]], &Damping::Constant(DAMPING))
        .expect("instantiate");
    block.register_inverse().expect("register inverse");
    block
}

fn per_use(
    uses: usize,
    rows: usize,
    cols: usize,
    seed: f32,
    device: &CpuDevice,
) -> Uses<Tensor<CpuRuntime>> {
    Uses::PerUse(
        (0..uses)
            .map(|u| {
                let data: Vec<f32> = (0..rows * cols)
                    .map(|i| ((i as f32 + 1.0) * (seed + 0.23 * u as f32)).cos())
                    .collect();
                Tensor::<CpuRuntime>::from_slice(&data, &[rows, cols], device).unwrap()
            })
            .collect(),
    )
}

/// Uses whose rows never overlap in the batch, so every lag-one moment is zero.
fn disjoint_rows(
    uses: usize,
    cols: usize,
    seed: f32,
    device: &CpuDevice,
) -> Uses<Tensor<CpuRuntime>> {
    Uses::PerUse(
        (0..uses)
            .map(|u| {
                let mut data = vec![0.0f32; uses * cols];
                for c in 0..cols {
                    data[u * cols + c] = ((c as f32 + 1.0) * (seed + u as f32)).sin() + 1.5;
                }
                Tensor::<CpuRuntime>::from_slice(&data, &[uses, cols], device).unwrap()
            })
            .collect(),
    )
}

/// Block inverse on `v` as an `[out, in]` matrix, beside the reference
/// operator applied to the same matrix.
fn compare(
    client: &CpuClient,
    device: &CpuDevice,
    block: &FullyConnectedSeriesFB<CpuRuntime>,
    in_dim: usize,
    out_dim: usize,
    reference: impl Fn(&SeriesStats, &SeriesStats, &DMatrix<f64>, f64) -> DMatrix<f64>,
) {
    let v_data: Vec<f32> = (0..in_dim * out_dim)
        .map(|i| ((i as f32 + 1.0) * 0.37).sin())
        .collect();
    let v = Tensor::<CpuRuntime>::from_slice(&v_data, &[in_dim, out_dim], device).unwrap();
    let out = block
        .multiply_inverse(client, &LayerParams::weights(v.clone()))
        .expect("inverse");
    let got = to_dmatrix(&out.tensors()[0]).transpose();

    let core = block.kronecker().unwrap();
    let t = block.num_timesteps().unwrap() as f64;
    let a = SeriesStats::read(core.input_factor().as_ref(), core.input_damping().call().unwrap());
    let g = SeriesStats::read(core.output_factor().as_ref(), core.output_damping().call().unwrap());
    let expected = reference(&a, &g, &to_dmatrix(&v).transpose(), t);

    let scale = expected.amax().max(1.0);
    for (x, y) in got.iter().zip(expected.iter()) {
        assert!((x - y).abs() < 1e-3 * scale, "{x} vs {y}\n{got}\n{expected}");
    }
}

#[test]
fn test_factor_damping_is_normalized_root() {
    let (client, device) = cpu_setup();
    let block = series_block(
        &client,
        SeriesApproximation::Option2,
        per_use(3, 4, 2, 0.3, &device),
        per_use(3, 4, 2, 0.8, &device),
    );
    let core = block.kronecker().unwrap();
    let expected = (DAMPING / 3.0).sqrt();
    assert!((core.input_damping().call().unwrap() - expected).abs() < 1e-12);
    assert!((core.output_damping().call().unwrap() - expected).abs() < 1e-12);
}

#[test]
fn test_zero_lag_reduces_to_scaled_kronecker_inverse() {
    let (client, device) = cpu_setup();
    let uses = 2;
    let (in_dim, out_dim) = (3, 2);
    for option in [SeriesApproximation::Option1, SeriesApproximation::Option2] {
        let block = series_block(
            &client,
            option,
            disjoint_rows(uses, in_dim, 0.4, &device),
            disjoint_rows(uses, out_dim, 0.9, &device),
        );
        let core = block.kronecker().unwrap();
        for dt1 in [core.input_factor().get_cov_dt1(), core.output_factor().get_cov_dt1()] {
            assert!(to_dmatrix(&dt1.unwrap()).amax() < 1e-7);
        }

        // G0⁻¹ Z A0⁻¹ / T
        compare(&client, &device, &block, in_dim, out_dim, |a, g, z, t| {
            sym_power(&g.c0, -1.0) * z * sym_power(&a.c0, -1.0) / t
        });
    }
}

#[test]
fn test_option1_matches_closed_form() {
    let (client, device) = cpu_setup();
    let block = series_block(
        &client,
        SeriesApproximation::Option1,
        per_use(4, 5, 3, 0.43, &device),
        per_use(4, 5, 2, 0.91, &device),
    );
    compare(&client, &device, &block, 3, 2, option1_reference);
}

#[test]
fn test_option2_matches_closed_form() {
    let (client, device) = cpu_setup();
    let block = series_block(
        &client,
        SeriesApproximation::Option2,
        per_use(4, 5, 3, 0.43, &device),
        per_use(4, 5, 2, 0.91, &device),
    );
    compare(&client, &device, &block, 3, 2, option2_reference);
}

#[test]
fn test_options_differ_once_lag_is_present() {
    let (client, device) = cpu_setup();
    let run = |option| {
        let block = series_block(
            &client,
            option,
            per_use(4, 5, 3, 0.43, &device),
            per_use(4, 5, 2, 0.91, &device),
        );
        let v = Tensor::<CpuRuntime>::ones(&[3, 2], numr::dtype::DType::F32, &device).unwrap();
        let out = block.multiply_inverse(&client, &LayerParams::weights(v)).unwrap();
        out.tensors()[0].to_vec::<f32>()
    };
    let a = run(SeriesApproximation::Option1);
    let b = run(SeriesApproximation::Option2);
    assert!(a.iter().zip(&b).any(|(x, y)| (x - y).abs() > 1e-6));
}
