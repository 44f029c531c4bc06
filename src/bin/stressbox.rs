use anyhow::Result;

fn main() -> Result<()> {
    stressbox::cli::run()
}
