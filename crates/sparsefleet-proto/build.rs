//! Protobuf / gRPC code generation for sparsefleet.
//!
//! Compiles `proto/sparsefleet.proto` with `prost` and generates tonic
//! client and server stubs for the three role services.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/sparsefleet.proto");

    if std::env::var_os("PROTOC").is_none() {
        let protoc_path = protoc_bin_vendored::protoc_bin_path()?;
        std::env::set_var("PROTOC", protoc_path);
    }

    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_protos(&["proto/sparsefleet.proto"], &["proto"])?;

    Ok(())
}
