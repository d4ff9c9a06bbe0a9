use std::env;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Keys forwarded from `.env` into the crate as compile-time defaults.
const CONFIG_KEYS: &[&str] = &[
    "PILIGHTS_PORT",
    "PILIGHTS_PIN_RED",
    "PILIGHTS_PIN_GREEN",
    "PILIGHTS_PIN_BLUE",
    "PILIGHTS_PIN_WHITE",
    "PILIGHTS_ALARM",
    "PILIGHTS_MAX_LEVEL",
    "PILIGHTS_STARTUP_FLASH",
];

fn main() {
    let _ = dotenvy::from_filename(".env");

    println!("cargo:rerun-if-changed=.env");
    println!("cargo:rerun-if-changed=build.rs");

    for key in CONFIG_KEYS {
        println!("cargo:rerun-if-env-changed={key}");
        if let Ok(val) = std::env::var(key) {
            println!("cargo:rustc-env={key}={val}");
        }
    }

    generate_board_pins();
}

/// Physical header pin -> BCM GPIO number for the 40-pin Raspberry Pi header.
const BOARD_TO_BCM: &[(u8, u8)] = &[
    (3, 2),
    (5, 3),
    (7, 4),
    (8, 14),
    (10, 15),
    (11, 17),
    (12, 18),
    (13, 27),
    (15, 22),
    (16, 23),
    (18, 24),
    (19, 10),
    (21, 9),
    (22, 25),
    (23, 11),
    (24, 8),
    (26, 7),
    (27, 0),
    (28, 1),
    (29, 5),
    (31, 6),
    (32, 12),
    (33, 13),
    (35, 19),
    (36, 16),
    (37, 26),
    (38, 20),
    (40, 21),
];

fn generate_board_pins() {
    let out_dir = env::var("OUT_DIR").unwrap();
    let dest_path = Path::new(&out_dir).join("board_pins.rs");
    let mut f = File::create(&dest_path).unwrap();

    writeln!(f, "// Auto-generated board pin table").unwrap();
    writeln!(f).unwrap();
    writeln!(f, "/// Map a physical header pin to its BCM GPIO number").unwrap();
    writeln!(f, "pub fn board_to_bcm(board_pin: u8) -> Option<u8> {{").unwrap();
    writeln!(f, "    match board_pin {{").unwrap();
    for (board, bcm) in BOARD_TO_BCM {
        writeln!(f, "        {board} => Some({bcm}),").unwrap();
    }
    writeln!(f, "        _ => None,").unwrap();
    writeln!(f, "    }}").unwrap();
    writeln!(f, "}}").unwrap();
}
