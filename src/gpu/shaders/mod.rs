//! WGSL sources of the training kernels.

/// Threads per workgroup of every one-unit-per-element kernel.
pub const WORKGROUP_SIZE: u32 = 64;

/// The complete shader module: shared bindings and helpers followed by every
/// kernel entry point.
pub fn kernel_wgsl() -> String {
    format!(
        r#"// Arena training kernels, workgroup size {workgroup_size}

{common}

{forward}

{loss}

{backward}

{update}
"#,
        workgroup_size = WORKGROUP_SIZE,
        common = include_str!("common.wgsl"),
        forward = include_str!("forward.wgsl"),
        loss = include_str!("loss.wgsl"),
        backward = include_str!("backward.wgsl"),
        update = include_str!("update.wgsl"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::{Kernel, KernelParams};

    #[test]
    fn test_every_kernel_has_an_entry_point() {
        let wgsl = kernel_wgsl();
        for kernel in Kernel::ALL {
            let signature = format!("fn {}(", kernel.entry_point());
            assert_eq!(wgsl.matches(&signature).count(), 1, "{signature}");
        }
    }

    #[test]
    fn test_params_struct_matches_host_layout() {
        let wgsl = kernel_wgsl();
        let start = wgsl.find("struct Params {").unwrap();
        let end = start + wgsl[start..].find('}').unwrap();
        let block = &wgsl[start..end];
        let fields = block.matches(": u32").count() + block.matches(": f32").count();
        assert_eq!(fields * 4, KernelParams::SIZE);
    }

    #[test]
    fn test_workgroup_size_matches_shader() {
        let wgsl = kernel_wgsl();
        assert!(wgsl.contains(&format!("const WORKGROUP_SIZE: u32 = {WORKGROUP_SIZE}u;")));
    }
}
