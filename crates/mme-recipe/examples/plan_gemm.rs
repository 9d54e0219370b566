//! Plan a GEMM and print the resulting walk
//!
//! Shows tile counts, the reuse decision and the first few descriptors.

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

    let params = LayerParams {
        op: OpType::Ab,
        a: TensorView::dense(sizes(&[1024, 4096]), DataType::Bf16),
        b: TensorView::dense(sizes(&[2048, 1024]), DataType::Bf16),
        c: TensorView::dense(sizes(&[2048, 4096]), DataType::Bf16),
        aux: None,
        strategy: Strategy::default(),
    };

    let hal = MmeHal::v2();
    let recipe = RecipeGenerator::new(params, &hal)?.generate()?;

    println!("op:            {:?}", recipe.op);
    println!("width tiles:   {}", recipe.fcd_subviews.len());
    println!("spatial tiles: {}", recipe.sp_subviews.len());
    println!("accum steps:   {}", recipe.accumulation_steps());
    println!("reuse:         {:?} ({:?})", recipe.reuse.operand, recipe.reuse.kind);
    println!("descriptors:   {}", recipe.descriptors_nr());
    println!();

    for pos in recipe.positions().take(8) {
        let fcd = &recipe.fcd_subviews[pos.fcd];
        let sp = &recipe.sp_subviews[pos.sp];
        println!(
            "  fcd {:>5}+{:<4} sp {:>5}+{:<4} accum {} store={}",
            fcd.offset,
            fcd.size,
            sp.offset,
            sp.size,
            recipe.accum_idx(&pos),
            recipe.store_en(&pos),
        );
    }

    Ok(())
}
