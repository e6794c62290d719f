//! Copy-Move Detection Example
//!
//! Runs the dense block detector on one image and writes the confidence map,
//! an overlay visualization and a JSON report.
//!
//! Run with: cargo run --example copy_move -- <image_path> [output_dir] [params.json]

use std::{env, fs, path::Path};

use copymove_forensics::{
    AnalysisConfig, ForensicsAnalyzer,
    analysis::copy_move::CopyMoveParams,
    error::Result,
    report::{JsonReport, visualization::Visualizer},
};

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        println!("Usage: {} <image_path> [output_dir] [params.json]", args[0]);
        return Ok(());
    }

    let image_path = &args[1];
    let output_dir = Path::new(args.get(2).map(|s| s.as_str()).unwrap_or("./output"));
    fs::create_dir_all(output_dir)?;

    let params = match args.get(3) {
        Some(path) => CopyMoveParams::from_json_file(path)?,
        None => CopyMoveParams::default(),
    };
    let config = AnalysisConfig {
        copy_move: params,
        ..Default::default()
    };

    let analyzer = ForensicsAnalyzer::new(image_path)?.with_config(config);
    let result = analyzer.detect_copy_move()?;

    result.save_map(output_dir.join("copy_move_map.png"))?;
    let vis = Visualizer::new().visualize_copy_move(&analyzer.image().to_rgb8(), &result);
    vis.save(output_dir.join("copy_move_result.png"))?;
    fs::write(output_dir.join("copy_move_report.json"), JsonReport::from(&result).to_json()?)?;

    println!("Status: {}", result.status);
    println!("Score: {:.3}", result.score);
    println!("Suspicious pixels: {:.2}%", result.suspicious_fraction * 100.0);
    println!(
        "Blocks: {}, candidates: {}, clusters: {}, verified regions: {}",
        result.stats.blocks, result.stats.candidates, result.stats.clusters, result.stats.verified_regions
    );

    for region in &result.regions {
        let (dx, dy) = region.model.translation_components();
        println!(
            "  Region {}: {} inlier matches, translation ({:.1}, {:.1})",
            region.cluster_id,
            region.inlier_count(),
            dx,
            dy
        );
    }

    Ok(())
}
