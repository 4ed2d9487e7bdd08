// Copyright 2025-2026 CEMAXECUTER LLC

fn main() {
    // Link args from iq_sdr's build script don't reach this binary, so the
    // rpath to libAaroniaRTSAAPI.so is embedded here as well.
    #[cfg(feature = "aaronia")]
    {
        let dir = std::env::var("AARONIA_RTSA_DIR")
            .unwrap_or_else(|_| "/opt/aaronia-rtsa-suite/Aaronia-RTSA-Suite-PRO".to_string());
        println!("cargo:rerun-if-env-changed=AARONIA_RTSA_DIR");
        if std::path::Path::new(&dir).is_dir() {
            println!("cargo:rustc-link-arg=-Wl,-rpath,{}", dir);
        }
    }
}
