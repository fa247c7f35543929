fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure().compile_protos(
        &["proto/device_plugin.proto", "proto/pod_resources.proto"],
        &["proto"],
    )?;
    Ok(())
}
