// Build script to compile protobuf files into Rust code.
//
// Runs at compile time and generates message structs and the Piecestore
// service traits from the .proto files in the proto/ directory.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    std::env::set_var("PROTOC", protobuf_src::protoc());

    tonic_build::compile_protos("proto/piecestore.proto")?;

    Ok(())
}
