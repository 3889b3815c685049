use std::path::Path;

use drivers::driver::command_args;
use drivers::{DipyDriver, FitMethod, FslDriver, TensorFitRequest, WarpRequest};

fn main() {
    println!("Commands issued for one atlas registration and tensor fit\n");

    let fsl = FslDriver::with_bin_dir(Path::new("/opt/fsl/bin"));
    let warp = fsl.build_warp_command(&WarpRequest {
        input: Path::new("space-MNI152_atlas-fan2016_res-1mm_dseg.nii.gz"),
        reference: Path::new("sub-0001_desc-brain_T1w.nii.gz"),
        mask: Path::new("sub-0001_desc-brain_mask.nii.gz"),
        warp_field: Path::new("sub-0001_from-MNI152NLin2009cAsym_to-T1w_mode-image_xfm.nii.gz"),
        output: Path::new("sub-0001_ses-1_space-T1w_atlas-fan2016_res-1mm_dseg.nii.gz"),
    });
    println!("{} {}", warp.get_program().to_string_lossy(), command_args(&warp).join(" "));

    let dipy = DipyDriver::with_bin_dir(Path::new("/opt/conda/bin"), FitMethod::Nlls);
    let fit = dipy.build_fit_command(&TensorFitRequest {
        dwi: Path::new("sub-0001_ses-1_acq-shell1000_dwi.nii.gz"),
        bval: Path::new("sub-0001_ses-1_acq-shell1000_dwi.bval"),
        bvec: Path::new("sub-0001_ses-1_acq-shell1000_dwi.bvec"),
        mask: Path::new("sub-0001_desc-brain_mask.nii.gz"),
        output_dir: Path::new("tensors/dipy"),
    });
    println!("{} {}", fit.get_program().to_string_lossy(), command_args(&fit).join(" "));
}
