use anyhow::Result;

use crate::filesystem::DataFileMode;

/// Entry points of the program execution engine
pub trait Runtime: Send + Sync {
    /// Run the program's main entry point to completion and return its exit code.
    /// May block for as long as the program runs.
    fn run_main(&self, args: &[String]) -> Result<i32>;

    fn unlink_file(&self, path: &str) -> Result<()>;

    fn create_data_file(&self, dir: &str, name: &str, content: &str, mode: DataFileMode)
        -> Result<()>;
}
