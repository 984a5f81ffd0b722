// This build script is used to generate the rust source files that
// we need for the CSI gRPC services.
fn main() -> Result<(), anyhow::Error> {
    let root = std::env::current_dir()?;
    let proto_files = ["proto/csi.proto"]
        .iter()
        .map(|name| root.join(name))
        .collect::<Vec<_>>();
    let include_dirs = ["proto/"]
        .iter()
        .map(|i| root.join(i))
        .collect::<Vec<_>>();
    let config = {
        let mut c = prost_build::Config::new();
        c.disable_comments(Some("."));
        c
    };
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos_with_config(config, &proto_files, &include_dirs)?;

    // This tells cargo to re-run this build script only when the proto files
    // we're interested in change or the any of the proto directories were updated.
    for path in [proto_files, include_dirs].concat() {
        println!("cargo:rerun-if-changed={}", path.display());
    }

    Ok(())
}
