use kfacr::fisher::{
    AnyFisherBlock, BlockKind, FullyConnectedMultiIndepFB, FullyConnectedSeriesFB, GradsList,
    SeriesApproximation, TowerData,
};
use kfacr::{Damping, Error, FisherBlock, KfacConfig, LayerCollection, LayerParams, Uses};
use numr::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};
use numr::tensor::Tensor;

fn cpu_setup() -> (CpuClient, CpuDevice) {
    let device = CpuDevice::new();
    let client = CpuClient::new(device.clone());
    (client, device)
}

fn host(rows: usize, cols: usize, seed: f32) -> Vec<f32> {
    (0..rows * cols)
        .map(|i| ((i as f32 + 1.0) * seed).cos())
        .collect()
}

/// Per-use tensors and the same data folded into one tensor along rows.
fn per_use_and_folded(
    uses: usize,
    rows: usize,
    cols: usize,
    seed: f32,
    device: &CpuDevice,
) -> (Uses<Tensor<CpuRuntime>>, Uses<Tensor<CpuRuntime>>) {
    let parts: Vec<Vec<f32>> = (0..uses)
        .map(|u| host(rows, cols, seed + 0.17 * u as f32))
        .collect();
    let folded: Vec<f32> = parts.concat();
    let per_use = parts
        .iter()
        .map(|p| Tensor::<CpuRuntime>::from_slice(p, &[rows, cols], device).unwrap())
        .collect();
    (
        Uses::PerUse(per_use),
        Uses::Folded(
            Tensor::<CpuRuntime>::from_slice(&folded, &[uses * rows, cols], device).unwrap(),
        ),
    )
}

#[test]
fn test_multi_indep_folded_matches_per_use() {
    let (client, device) = cpu_setup();
    let (x_per_use, x_folded) = per_use_and_folded(3, 4, 2, 0.31, &device);
    let (y_per_use, y_folded) = per_use_and_folded(3, 4, 2, 0.77, &device);
    let damping = Damping::Constant(0.1);

    let mut per_use = FullyConnectedMultiIndepFB::new(true, None);
    per_use.register_additional_tower(&x_per_use, &y_per_use);
    let mut collection = LayerCollection::new(KfacConfig::default()).expect("valid config");
    per_use
        .instantiate_factors(&client, &mut collection, &[vec![y_per_use]], &damping)
        .expect("per-use instantiate");

    let mut folded = FullyConnectedMultiIndepFB::new(true, Some(3));
    folded.register_additional_tower(&x_folded, &y_folded);
    let mut collection = LayerCollection::new(KfacConfig::default()).expect("valid config");
    folded
        .instantiate_factors(&client, &mut collection, &[vec![y_folded]], &damping)
        .expect("folded instantiate");

    assert_eq!(per_use.num_uses(), Some(3));
    assert_eq!(folded.kronecker().unwrap().renorm_coeff(), 3.0);

    let a = per_use.full_fisher_block(&client).unwrap().to_vec::<f32>();
    let b = folded.full_fisher_block(&client).unwrap().to_vec::<f32>();
    assert_eq!(a.len(), 36);
    for (x, y) in a.iter().zip(&b) {
        assert!((x - y).abs() < 1e-5);
    }
}

#[test]
fn test_series_lifecycle_through_enum() {
    let (client, device) = cpu_setup();
    for option in [SeriesApproximation::Option1, SeriesApproximation::Option2] {
        let (x, _) = per_use_and_folded(4, 5, 3, 0.43, &device);
        let (y, _) = per_use_and_folded(4, 5, 2, 0.91, &device);

        let mut block: AnyFisherBlock<CpuRuntime> =
            FullyConnectedSeriesFB::new(true, None, option).into();
        assert_eq!(block.kind(), BlockKind::FullyConnectedSeries);
        block
            .register_additional_tower(TowerData::MultiUse {
                inputs: x,
                outputs: y.clone(),
            })
            .expect("tower");
        assert_eq!(block.tensors_to_compute_grads().len(), 4);

        let mut collection = LayerCollection::new(KfacConfig::default()).expect("valid config");
        block
            .instantiate_factors(
                &client,
                &mut collection,
                &GradsList::Uses(vec![vec![y]]),
                &Damping::Constant(0.1),
            )
            .expect("instantiate");

        assert!(matches!(block.register_matpower(2.0), Err(Error::Unsupported { .. })));
        block.register_inverse().expect("register inverse");

        let v = LayerParams::with_bias(
            Tensor::<CpuRuntime>::from_slice(&host(3, 2, 1.3), &[3, 2], &device).unwrap(),
            Tensor::<CpuRuntime>::from_slice(&host(1, 2, 2.1), &[2], &device).unwrap(),
        );
        let out = block.multiply_inverse(&client, &v).expect("inverse");
        assert_eq!(out.tensors()[0].shape(), &[3, 2]);
        assert_eq!(out.tensors()[1].shape(), &[2]);
        for t in out.tensors() {
            assert!(t.to_vec::<f32>().iter().all(|x| x.is_finite()), "{option}");
        }
        assert!(matches!(block.multiply(&client, &v), Err(Error::Unsupported { .. })));
    }
}

#[test]
fn test_series_needs_two_uses() {
    let (client, device) = cpu_setup();
    let x = Tensor::<CpuRuntime>::from_slice(&host(4, 2, 0.5), &[4, 2], &device).unwrap();
    let y = Tensor::<CpuRuntime>::from_slice(&host(4, 2, 0.9), &[4, 2], &device).unwrap();

    let mut block = FullyConnectedSeriesFB::new(false, Some(1), SeriesApproximation::Option2);
    block.register_additional_tower(&Uses::Folded(x), &Uses::Folded(y.clone()));
    let mut collection = LayerCollection::new(KfacConfig::default()).expect("valid config");
    let err = block
        .instantiate_factors(
            &client,
            &mut collection,
            &[vec![Uses::Folded(y)]],
            &Damping::Constant(0.1),
        )
        .unwrap_err();
    assert!(matches!(err, Error::UseCount { .. }));
}
