// Photo processing pipeline: segmentation, tiled detection, band estimation
// and the coordinator that ties them to storage and persistence.

pub mod aggregate;
pub mod artifact;
pub mod crop;
pub mod detection;
pub mod estimation;
pub mod fanin;
pub mod geometry;
pub mod orchestrator;
pub mod segmentation;
pub mod slicing;
#[cfg(test)]
pub mod testkit;
pub mod types;
pub mod vegetation;
pub mod workers;
