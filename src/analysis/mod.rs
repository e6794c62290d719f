pub mod block_features;
pub mod cancel;
pub mod confidence_map;
pub mod copy_move;
pub mod geometric;
pub mod kd_tree;
pub mod matcher;
pub mod offset_clustering;
pub mod transform_cache;
