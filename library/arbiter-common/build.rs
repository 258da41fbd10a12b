// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use pathbuf::pathbuf;
use tonic_build::configure;

fn main() -> Result<()> {
	if std::env::var_os("PROTOC").is_none() {
		std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
	}

	// Compile the Arbiter gRPC protocol specs to .rs files
	let root = env!("CARGO_MANIFEST_DIR");

	let protos = vec![
		pathbuf![root, "proto", "arbiter", "data", "v1", "data.proto"],
		pathbuf![root, "proto", "arbiter", "policy", "v1", "policy.proto"],
		pathbuf![root, "proto", "arbiter", "bulk", "v1", "bulk.proto"],
	];
	let includes = vec![pathbuf![root, "proto"]];

	configure().compile_protos(&protos, &includes)?;

	Ok(())
}
