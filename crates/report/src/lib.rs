pub mod vault;

pub use vault::{write_analysis_report, write_bench_report, write_index, ReportPaths};
