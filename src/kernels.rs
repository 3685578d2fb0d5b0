/*!
Kernel sources.

[`CUBE_SOURCE`] is the reference kernel of the [`Pipeline`](crate::pipeline::Pipeline):

```c
__kernel void cube(__global int* input, __global int* output, const unsigned int count)
```

It sets `output[i] = input[i] * input[i] * input[i]` for every `i < count`.
*/

/// OpenCL C source of the `cube` kernel.
pub const CUBE_SOURCE: &str = include_str!("kernels/cube.cl");

/// The entry point of [`CUBE_SOURCE`].
pub const CUBE_ENTRY: &str = "cube";

/// The number of elements cubed by default.
pub const DATA_SIZE: usize = 128;

/// Cubes `input` on the host.
///
/// Overflow wraps, like 32-bit integer arithmetic on the device.
pub fn cube_reference(input: &[i32]) -> Vec<i32> {
    input
        .iter()
        .map(|x| x.wrapping_mul(*x).wrapping_mul(*x))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference() {
        assert_eq!(cube_reference(&[2, 5, 9, -3]), [8, 125, 729, -27]);
        assert_eq!(cube_reference(&[2048])[0], 0);
    }
}
