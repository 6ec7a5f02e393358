use std::sync::Arc;

use anyhow::Result;
use dnn_rs::conv::backward_data::policy::AlgoPolicySetting;
use dnn_rs::{
    AlgoPolicy, ConvolutionBackwardData, ConvolutionParam, DType, TensorLayout, TensorNd,
};
use dnn_rs_backend_ref_cpu::{reference_library, CpuBackend, HostBuffer};
use serde_json::json;

fn main() -> Result<()> {
    let backend = Arc::new(CpuBackend::new());
    let setting: AlgoPolicySetting = serde_json::from_value(json!(
        "force=INT8_NHWC_IMMA_IMPLICIT_GEMM_128X32X32_64X32X32_1stage_8"
    ))?;
    let param = ConvolutionParam::nhwc().with_stride(2, 2).with_padding(1, 1);
    let opr = ConvolutionBackwardData::with_policy(
        Arc::clone(&backend),
        reference_library(),
        param,
        AlgoPolicy::from_setting(setting),
    );

    let filter = TensorLayout::contiguous([16, 3, 3, 16], DType::QuantizedS8 { scale: 0.25 });
    let diff = TensorLayout::contiguous([1, 4, 4, 16], DType::QuantizedS8 { scale: 1.0 });
    let grad = TensorLayout::contiguous([1, 8, 8, 16], DType::QuantizedS8 { scale: 0.5 });

    let args = opr.deduce_size_args(&filter, &diff, &grad)?;
    let ws_size = opr.get_workspace_in_bytes(&filter, &diff, &grad)?;
    let algo = opr.get_algorithm_heuristic(&args, ws_size)?;
    println!("selected {} with {ws_size} workspace bytes", algo.name());

    let filter_values = (0..filter.total_elements())
        .map(|i| (i % 7) as i8 - 3)
        .collect();
    let filter_buf = HostBuffer::from_vec(filter_values);
    let diff_buf = HostBuffer::from_vec(vec![1; diff.total_elements()]);
    let grad_buf = HostBuffer::zeroed(grad.dense_bytes());
    let workspace = HostBuffer::zeroed(ws_size);
    opr.exec(
        TensorNd::new(&filter, &filter_buf),
        TensorNd::new(&diff, &diff_buf),
        TensorNd::new(&grad, &grad_buf),
        &workspace,
    )?;
    println!("first grad row: {:?}", &grad_buf.to_vec()[..16]);
    Ok(())
}
