pub mod add_offsets;
pub mod add_partitions;
pub mod end_txn;
pub mod init_pid;
pub mod offset_commit;
pub mod produce;
