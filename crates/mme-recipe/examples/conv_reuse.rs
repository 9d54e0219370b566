//! Plan a forward convolution and inspect the staging-buffer decision
//!
//! Runs the same layer with reuse on and off to show the difference in
//! walk depth.

use mme_hal::{DataType, MmeHal};
use mme_recipe::{LayerParams, OpType, RecipeGenerator, Strategy, TensorView, MAX_DIMS};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("mme_recipe=debug")
        .init();

    let sizes = |v: &[u64]| {
        let mut out = [1; MAX_DIMS];
        out[..v.len()].copy_from_slice(v);
        out
    };

    let base = LayerParams {
        op: OpType::Fwd,
        a: TensorView::dense(sizes(&[256, 112, 112, 1, 8]), DataType::Bf16),
        b: TensorView::dense(sizes(&[128, 256, 3, 3]), DataType::Bf16),
        c: TensorView::dense(sizes(&[128, 112, 112, 1, 8]), DataType::Bf16),
        aux: None,
        strategy: Strategy::default(),
    };
    let hal = MmeHal::v2();

    for reuse in [true, false] {
        let mut params = base.clone();
        params.strategy.sb_reuse = reuse;
        let recipe = RecipeGenerator::new(params, &hal)?.generate()?;
        println!(
            "sb_reuse={reuse}: {:?} kind={:?} accum_steps={} descriptors={}",
            recipe.reuse.operand,
            recipe.reuse.kind,
            recipe.accumulation_steps(),
            recipe.descriptors_nr(),
        );
    }

    Ok(())
}
