// ===============================
// src/symbol.rs
// ===============================
//
// Two notations for share classes:
// - broker / API : BRK.B
// - storage files: BRK-B
// Core logic always works in broker notation; convert only at the file boundary.
//

pub fn to_broker(symbol: &str) -> String {
    symbol.trim().to_ascii_uppercase().replace('-', ".")
}

pub fn to_storage(symbol: &str) -> String {
    symbol.trim().to_ascii_uppercase().replace('.', "-")
}
