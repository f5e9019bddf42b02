fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::compile_protos("proto/lease.proto")?;
    println!("cargo:rerun-if-changed=proto/lease.proto");
    Ok(())
}
