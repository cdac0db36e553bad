fn main() {
    linker_be_nice();
    // Linker scripts only apply to the firmware image; host test binaries link normally.
    if std::env::var("CARGO_FEATURE_FIRMWARE").is_ok() {
        println!("cargo:rustc-link-arg-bins=-Tdefmt.x");
        // make sure linkall.x is the last linker script (otherwise might cause problems with flip-link)
        println!("cargo:rustc-link-arg-bins=-Tlinkall.x");
    }
}

fn linker_be_nice() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        let kind = &args[1];
        let what = &args[2];

        match kind.as_str() {
            "undefined-symbol" => match what.as_str() {
                "_defmt_timestamp" => {
                    eprintln!();
                    eprintln!("💡 `defmt` not found - make sure `defmt.x` is added as a linker script and you have included `use defmt_rtt as _;`");
                    eprintln!();
                }
                "_stack_start" => {
                    eprintln!();
                    eprintln!("💡 Is the linker script `linkall.x` missing?");
                    eprintln!();
                }
                "esp_rtos_initialized" | "esp_rtos_yield_task" | "esp_rtos_task_create" => {
                    eprintln!();
                    eprintln!("💡 `esp-radio` has a scheduler as a dependency. Make sure to use `esp-rtos`.");
                    eprintln!();
                }
                "embedded_test_linker_file_not_added_to_rustflags" => {
                    eprintln!();
                    eprintln!("💡 `embedded-test` not found - make sure `embedded-test.x` is added as a linker script for tests");
                    eprintln!();
                }
                _ => (),
            },
            // we don't have anything helpful for "missing-lib" yet
            _ => {
                std::process::exit(1);
            }
        }

        std::process::exit(0);
    }

    if std::env::var("CARGO_FEATURE_FIRMWARE").is_ok() {
        println!(
            "cargo:rustc-link-arg-bins=-Wl,--error-handling-script={}",
            std::env::current_exe().unwrap().display()
        );
    }
}
