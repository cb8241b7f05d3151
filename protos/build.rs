// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

fn main() -> Result<(), Box<dyn std::error::Error>> {
    std::env::set_var(
        "PROTOC",
        protoc_bin_vendored::protoc_bin_path().expect("vendored protoc binary"),
    );

    let mut config = prost_build::Config::new();
    config.bytes(["."]);
    config.disable_comments(["."]);

    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_with_config(
            config,
            &[
                "protos/cisco/mdt_grpc_dialout.proto",
                "protos/cisco/telemetry.proto",
            ],
            &["protos/cisco"],
        )?;

    Ok(())
}
