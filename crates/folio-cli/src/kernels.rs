//! Kernels command implementation for folio CLI.

use folio_core::kernel::{kernel_search_paths, list_kernel_specs};

use crate::colors;

/// List kernel specs found on the search path.
pub fn execute() {
    let roots = kernel_search_paths();
    let specs = list_kernel_specs(&roots);

    if specs.is_empty() {
        println!("{}No kernel specs found.{}", colors::YELLOW, colors::RESET);
        println!("Searched:");
        for root in &roots {
            println!("  {}{}{}", colors::DIM, root.display(), colors::RESET);
        }
        return;
    }

    let width = specs.iter().map(|s| s.name.len()).max().unwrap_or(0);
    for spec in &specs {
        println!(
            "{}{:<width$}{}  {}  {}{}{}",
            colors::BOLD,
            spec.name,
            colors::RESET,
            spec.language.as_deref().unwrap_or("-"),
            colors::DIM,
            spec.resource_dir.display(),
            colors::RESET,
        );
    }
}
