// Build plumbing: pulling syn (with the `full` feature) into the host/build
// dependency graph forces feature unification so the quickcheck_async 0.1.1
// proc-macro crate compiles. No actual build-time codegen is performed.
fn main() {
    println!("cargo:rerun-if-changed=build.rs");
}
