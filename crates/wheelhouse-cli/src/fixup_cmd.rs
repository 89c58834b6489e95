use std::path::Path;

use anyhow::Result;

use wheelhouse_core::{fix_up_intermediate_files, index_url};

pub fn run_fixup(dir: &Path, port: u16) -> Result<()> {
    let summary = fix_up_intermediate_files(dir, port)?;

    for path in &summary.rewritten {
        println!("rewrote {}", path.display());
    }
    println!(
        "{} of {} intermediate file(s) now point at {}",
        summary.rewritten.len(),
        summary.matched,
        index_url(port)
    );
    Ok(())
}
