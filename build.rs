fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Client and server stubs are both generated; the server side backs the
    // in-process mock used by the integration tests.
    tonic_prost_build::configure()
        .compile_protos(&["proto/inference/grpc_service.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto");

    Ok(())
}
