pub mod manager;

pub use manager::{
    MasterPointer, MasterpointerContainer, MasterpointerIterator, MasterpointerManager, MptrHandle,
    SlotIndex, NIL,
};
