fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use vendored protoc so we don't rely on system protoc
    let protoc = protoc_bin_vendored::protoc_bin_path().expect("vendored protoc");
    std::env::set_var("PROTOC", protoc);

    // The vendored include dir carries google/protobuf/duration.proto.
    let includes = [
        std::path::PathBuf::from("proto"),
        protoc_bin_vendored::include_path().expect("vendored protoc include dir"),
    ];

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        // Chunk payloads move through the stream adapters without copying.
        .bytes([".rpcprof.v1.Chunk.chunk"])
        .compile(&["proto/rpcprof.proto"], &includes)?;
    Ok(())
}
