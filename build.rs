//! Build script for compile-time configuration injection.
//!
//! Set environment variables before building to configure a room unit:
//!
//!   ROOM_NODE_SSID=HotelWiFi \
//!   ROOM_NODE_PASSWORD=secret123 \
//!   ROOM_NODE_WS_HOST=192.168.1.20 \
//!   ROOM_NODE_WS_PORT=8443 \
//!   ROOM_NODE_ROOM=305 \
//!   ROOM_NODE_HOTEL_ID=3 \
//!   cargo build --release
//!
//! Every unit in an installation runs the same firmware; only these values differ.

const CONFIG_VARS: &[&str] = &[
    "ROOM_NODE_SSID",
    "ROOM_NODE_PASSWORD",
    "ROOM_NODE_WS_HOST",
    "ROOM_NODE_WS_PORT",
    "ROOM_NODE_WS_PATH",
    "ROOM_NODE_WS_SECURE",
    "ROOM_NODE_ROOM",
    "ROOM_NODE_BUILDING",
    "ROOM_NODE_HOTEL_ID",
    "ROOM_NODE_UTC_OFFSET",
    "ROOM_NODE_DST_OFFSET",
];

fn main() {
    // Re-run build script if any unit configuration changes
    for var in CONFIG_VARS {
        println!("cargo::rerun-if-env-changed={}", var);
    }
}
