//! Container runtime gateway implementations.
//!
//! Each implementation drives one container engine through the
//! [`ContainerRuntime`](crate::runtime::ContainerRuntime) trait.

pub mod docker;

pub use self::docker::DockerCliRuntime;
