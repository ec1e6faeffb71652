pub mod native;

#[cfg(feature = "backend-openvino")]
pub mod openvino;

#[cfg(feature = "backend-tensorflow")]
pub mod tensorflow;
