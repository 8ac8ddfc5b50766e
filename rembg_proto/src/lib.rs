tonic::include_proto!("rembg_service");

pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("rembg_descriptor");
