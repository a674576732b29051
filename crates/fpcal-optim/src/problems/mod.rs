pub mod posparams;
