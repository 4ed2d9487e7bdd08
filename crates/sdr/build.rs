// Copyright 2025-2026 CEMAXECUTER LLC

fn main() {
    #[cfg(feature = "aaronia")]
    {
        // The library resolves its support files relative to its own install dir
        let dir = std::env::var("AARONIA_RTSA_DIR")
            .unwrap_or_else(|_| "/opt/aaronia-rtsa-suite/Aaronia-RTSA-Suite-PRO".to_string());
        println!("cargo:rerun-if-env-changed=AARONIA_RTSA_DIR");
        println!("cargo:rustc-link-search=native={}", dir);
        println!("cargo:rustc-link-arg=-Wl,-rpath,{}", dir);
        println!("cargo:rustc-link-lib=AaroniaRTSAAPI");
    }
}
