//! Network object identifiers.
//!
//! The wire protocol assigns every networked object (ships, torpedoes, any
//! future sub-objects) an id computed from a base offset plus the owning
//! game slot's reserved block: base `0x3FFFFFFF`, each slot owns `2^18`
//! (262144) consecutive ids. `sub_index` selects within a slot's block; a
//! ship's own id always uses `sub_index = 0`.

pub const OBJECT_ID_BASE: i32 = 0x3FFF_FFFF;
pub const SLOT_ID_SPAN: u32 = 0x4_0000;

pub fn make_object_id(game_slot: u8, sub_index: u32) -> i32 {
    (OBJECT_ID_BASE as u32)
        .wrapping_add(game_slot as u32 * SLOT_ID_SPAN)
        .wrapping_add(sub_index) as i32
}

pub fn make_ship_id(game_slot: u8) -> i32 {
    make_object_id(game_slot, 0)
}

/// Inverse of [`make_object_id`]: recovers the owning game slot, or `None`
/// if the id falls below the base or past the last valid slot.
pub fn object_id_to_slot(object_id: i32, max_slots: u8) -> Option<u8> {
    let offset = object_id.wrapping_sub(OBJECT_ID_BASE);
    if offset < 0 {
        return None;
    }
    let slot = (offset as u32) >> 18;
    if slot >= max_slots as u32 {
        return None;
    }
    Some(slot as u8)
}
