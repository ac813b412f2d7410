pub fn run() -> anyhow::Result<()> {
    println!("pgguard-storage-operator {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
