/// Build script para proyectos ESP-IDF.
///
/// `embuild::espidf::sysenv::output()` propaga la configuración que
/// `esp-idf-sys` deja para el linker y el cross-compiler. En el host
/// (tests de la librería) no hay SDK que propagar.
fn main() {
    println!("cargo:rerun-if-env-changed=PALPALETTE_SERVER_URL");

    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::espidf::sysenv::output();
    }
}
