pub mod store;

pub use store::{
    DeviceStateRow, ExpiredTransfer, StoreError, TransferRow, TransferStatus, WakeEventRow,
    WakeStore,
};
